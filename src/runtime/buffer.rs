//! `Buffer` and `Blob` for the module scope
//!
//! `Buffer` is a `Uint8Array` subclass defined in JS; string encoding and
//! decoding (utf8, hex, base64, base64url, latin1, utf16le) happen in Rust.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use boa_engine::{
    Context, JsArgs, JsNativeError, JsResult, JsValue, NativeFunction, js_string,
    object::builtins::{JsArrayBuffer, JsUint8Array},
};

use super::eval_glue;

/// Encode a string to bytes using the specified encoding
pub(crate) fn encode_string(string: &str, encoding: &str) -> JsResult<Vec<u8>> {
    match encoding.to_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(string.as_bytes().to_vec()),
        "ascii" | "latin1" | "binary" => Ok(string.chars().map(|c| (c as u32 & 0xFF) as u8).collect()),
        "hex" => Ok(hex_decode(string)),
        "base64" | "base64url" => {
            let standard: String = string
                .trim_end_matches('=')
                .chars()
                .map(|c| match c {
                    '-' => '+',
                    '_' => '/',
                    c => c,
                })
                .collect();
            let padding = (4 - standard.len() % 4) % 4;
            let padded = format!("{standard}{}", "=".repeat(padding));
            BASE64_STANDARD
                .decode(padded)
                .map_err(|e| JsNativeError::typ().with_message(format!("Invalid base64: {e}")).into())
        }
        "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => {
            Ok(string.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect())
        }
        _ => Err(JsNativeError::typ()
            .with_message(format!("Unknown encoding: {encoding}"))
            .into()),
    }
}

/// Decode bytes to a string using the specified encoding
pub(crate) fn decode_bytes(bytes: &[u8], encoding: &str) -> JsResult<String> {
    match encoding.to_lowercase().as_str() {
        "utf8" | "utf-8" => Ok(String::from_utf8_lossy(bytes).into_owned()),
        "ascii" | "latin1" | "binary" => Ok(bytes.iter().map(|&b| b as char).collect()),
        "hex" => Ok(bytes.iter().map(|b| format!("{b:02x}")).collect()),
        "base64" => Ok(BASE64_STANDARD.encode(bytes)),
        "base64url" => Ok(BASE64_STANDARD
            .encode(bytes)
            .replace('+', "-")
            .replace('/', "_")
            .replace('=', "")),
        "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            Ok(String::from_utf16_lossy(&units))
        }
        _ => Err(JsNativeError::typ()
            .with_message(format!("Unknown encoding: {encoding}"))
            .into()),
    }
}

/// Decode hex pairs, stopping at the first invalid pair
fn hex_decode(s: &str) -> Vec<u8> {
    s.trim()
        .as_bytes()
        .chunks(2)
        .map_while(|pair| std::str::from_utf8(pair).ok().and_then(|p| u8::from_str_radix(p, 16).ok()))
        .collect()
}

fn encoding_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    match args.get_or_undefined(index) {
        v if v.is_undefined() || v.is_null() => Ok("utf8".to_string()),
        v => Ok(v.to_string(context)?.to_std_string_escaped()),
    }
}

/// `(string, encoding) -> Uint8Array`
fn encode_native(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let string = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let encoding = encoding_arg(args, 1, context)?;
    let bytes = encode_string(&string, &encoding)?;

    let array_buffer = JsArrayBuffer::new(bytes.len(), context)?;
    let array = JsUint8Array::from_array_buffer(array_buffer, context)?;
    for (i, byte) in bytes.iter().enumerate() {
        array.set(i, JsValue::from(u32::from(*byte)), false, context)?;
    }
    Ok(array.into())
}

/// `(uint8array, encoding) -> string`
fn decode_native(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let object = args
        .get_or_undefined(0)
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("Expected Uint8Array"))?;
    let array = JsUint8Array::from_object(object)?;
    let encoding = encoding_arg(args, 1, context)?;
    let length = array.length(context)?;
    let mut bytes = Vec::with_capacity(length);
    for i in 0..length {
        bytes.push(array.get(i, context)?.to_u32(context)? as u8);
    }
    Ok(js_string!(decode_bytes(&bytes, &encoding)?).into())
}

const BUFFER_JS: &str = r#"
(function (encode, decode) {
    class Buffer extends Uint8Array {
        static from(value, encodingOrOffset, length) {
            if (typeof value === "string") return Buffer.fromBytes(encode(value, encodingOrOffset));
            if (value instanceof ArrayBuffer) {
                return new Buffer(value, encodingOrOffset || 0, length === undefined ? value.byteLength - (encodingOrOffset || 0) : length);
            }
            if (value && typeof value.length === "number") return Buffer.fromBytes(value);
            if (value && value.type === "Buffer" && Array.isArray(value.data)) return Buffer.fromBytes(value.data);
            throw new TypeError("The first argument must be a string, Buffer, ArrayBuffer or Array");
        }
        static fromBytes(bytes) {
            const buf = new Buffer(bytes.length);
            for (let i = 0; i < bytes.length; i++) buf[i] = bytes[i];
            return buf;
        }
        static alloc(size, fill) {
            const buf = new Buffer(size);
            if (fill !== undefined) buf.fill(typeof fill === "string" ? fill.charCodeAt(0) : fill);
            return buf;
        }
        static allocUnsafe(size) { return new Buffer(size); }
        static isBuffer(value) { return value instanceof Buffer; }
        static byteLength(value, encoding) {
            return typeof value === "string" ? encode(value, encoding).length : value.byteLength;
        }
        static concat(list, total) {
            const length = total === undefined ? list.reduce((n, b) => n + b.length, 0) : total;
            const out = Buffer.alloc(length);
            let offset = 0;
            for (const b of list) {
                out.set(b.subarray(0, Math.max(0, length - offset)), offset);
                offset += b.length;
                if (offset >= length) break;
            }
            return out;
        }
        static isEncoding(encoding) {
            return ["utf8", "utf-8", "hex", "base64", "base64url", "ascii", "latin1", "binary", "ucs2", "ucs-2", "utf16le", "utf-16le"]
                .includes(String(encoding).toLowerCase());
        }
        toString(encoding, start, end) {
            return decode(this.subarray(start || 0, end === undefined ? this.length : end), encoding);
        }
        toJSON() { return { type: "Buffer", data: Array.from(this) }; }
        equals(other) {
            return this.length === other.length && this.every((b, i) => b === other[i]);
        }
        slice(start, end) {
            const view = this.subarray(start, end);
            return new Buffer(view.buffer, view.byteOffset, view.length);
        }
        write(string, offset, encoding) {
            const bytes = encode(string, encoding);
            const start = offset || 0;
            const count = Math.min(bytes.length, this.length - start);
            for (let i = 0; i < count; i++) this[start + i] = bytes[i];
            return count;
        }
    }

    class Blob {
        constructor(parts = [], options = {}) {
            const chunks = parts.map((p) => (typeof p === "string" ? encode(p, "utf8") : p instanceof Blob ? p._bytes : Buffer.from(p)));
            this._bytes = Buffer.concat(chunks);
            this.type = options.type ? String(options.type).toLowerCase() : "";
        }
        get size() { return this._bytes.length; }
        text() { return Promise.resolve(decode(this._bytes, "utf8")); }
        arrayBuffer() { return Promise.resolve(this._bytes.buffer.slice(0)); }
        slice(start, end, type) {
            const blob = new Blob([], { type });
            blob._bytes = Buffer.from(this._bytes.subarray(start, end));
            return blob;
        }
    }

    return [Buffer, Blob];
})
"#;

/// Create the `Buffer` and `Blob` constructors
pub(crate) fn create_buffer_classes(context: &mut Context) -> JsResult<(JsValue, JsValue)> {
    let encode = NativeFunction::from_fn_ptr(encode_native).to_js_function(context.realm());
    let decode = NativeFunction::from_fn_ptr(decode_native).to_js_function(context.realm());
    let pair = eval_glue("runner:buffer", BUFFER_JS, &[encode.into(), decode.into()], context)?;
    let pair = pair
        .as_object()
        .map(|o| o.clone())
        .ok_or_else(|| JsNativeError::typ().with_message("buffer glue returned no classes"))?;
    let buffer = pair.get(0u32, context)?;
    let blob = pair.get(1u32, context)?;
    Ok((buffer, blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_variants() {
        assert_eq!(decode_bytes(b"hi?", "base64").unwrap(), "aGk/");
        assert_eq!(decode_bytes(b"hi?", "base64url").unwrap(), "aGk_");
        assert_eq!(encode_string("aGk_", "base64url").unwrap(), b"hi?");
        assert_eq!(encode_string("aGk", "base64").unwrap(), b"hi");
    }

    #[test]
    fn test_hex_and_utf16() {
        assert_eq!(decode_bytes(&[0xde, 0xad], "hex").unwrap(), "dead");
        assert_eq!(encode_string("dead", "hex").unwrap(), vec![0xde, 0xad]);
        assert_eq!(encode_string("dezz", "hex").unwrap(), vec![0xde]);
        let bytes = encode_string("hé", "utf16le").unwrap();
        assert_eq!(decode_bytes(&bytes, "utf16le").unwrap(), "hé");
    }

    #[test]
    fn test_unknown_encoding_fails() {
        assert!(encode_string("x", "klingon").is_err());
    }

    #[test]
    fn test_buffer_round_trip_in_engine() {
        let mut context = Context::default();
        let (buffer, _) = create_buffer_classes(&mut context).unwrap();
        context
            .global_object()
            .set(js_string!("Buffer"), buffer, false, &mut context)
            .unwrap();
        let value = context
            .eval(boa_engine::Source::from_bytes(
                "Buffer.from('aGVsbG8=', 'base64').toString() + ':' + Buffer.from('hi').toString('hex')",
            ))
            .unwrap();
        assert_eq!(value.to_string(&mut context).unwrap().to_std_string_escaped(), "hello:6869");
    }
}
