//! Fake document: resources load as soon as they are inserted

use super::{DomStrategy, ScriptAttributes, Timing};

pub(crate) struct FakeDom;

impl DomStrategy for FakeDom {
    fn script_timing(&self, script: &ScriptAttributes) -> Timing {
        if script.is_async || script.defer || script.module {
            Timing::Microtask
        } else {
            Timing::Immediate
        }
    }

    fn link_timing(&self) -> Timing {
        Timing::Immediate
    }
}
