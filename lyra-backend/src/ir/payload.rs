//!
//! The serialized payload format of the hook IR.
//!

use crate::ir::Module;

/// The payload magic.
const MAGIC: &[u8; 4] = b"LYRB";

/// The payload format version.
const VERSION: u8 = 1;

///
/// The payload decoding error.
///
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// The buffer does not start with the payload magic.
    #[error("not a hook IR payload")]
    Magic,
    /// The payload version is newer than this reader.
    #[error("unsupported payload version {0}")]
    Version(u8),
    /// The CBOR body is malformed.
    #[error("malformed payload body: {0}")]
    Body(String),
}

///
/// Encodes a module into a payload buffer.
///
pub fn encode_payload(module: &Module) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(1024);
    buffer.extend_from_slice(MAGIC);
    buffer.push(VERSION);
    ciborium::into_writer(module, &mut buffer).expect("CBOR writing to a vector cannot fail");
    buffer
}

///
/// Decodes a payload buffer into a module.
///
pub fn decode_payload(bytes: &[u8]) -> Result<Module, PayloadError> {
    let body = bytes
        .strip_prefix(MAGIC.as_slice())
        .ok_or(PayloadError::Magic)?;
    let (version, body) = body.split_first().ok_or(PayloadError::Magic)?;
    if *version != VERSION {
        return Err(PayloadError::Version(*version));
    }
    ciborium::from_reader(body).map_err(|error| PayloadError::Body(error.to_string()))
}

///
/// Whether a buffer looks like a hook IR payload.
///
pub fn is_payload(bytes: &[u8]) -> bool {
    bytes.starts_with(MAGIC.as_slice())
}

#[cfg(test)]
mod tests {
    use crate::ir::Function;
    use crate::ir::Inst;
    use crate::ir::Module;

    use super::PayloadError;
    use super::decode_payload;
    use super::encode_payload;
    use super::is_payload;

    #[test]
    fn payload_round_trip() {
        let mut module = Module::new("tool".to_owned(), "cu-0".to_owned());
        module.add_function(Function {
            name: "hook".to_owned(),
            param_count: 1,
            is_hook: true,
            body: vec![Inst::Return { value: None }],
        });
        let bytes = encode_payload(&module);
        assert!(is_payload(bytes.as_slice()));
        let decoded = decode_payload(bytes.as_slice()).expect("Always valid");
        assert_eq!(decoded, module);
        assert_eq!(
            decoded.functions.get("hook").expect("Always exists").body,
            vec![Inst::Return { value: None }]
        );
    }

    #[test]
    fn rejects_foreign_buffers() {
        assert!(matches!(
            decode_payload(b"ELF\x7f....").expect_err("Must fail"),
            PayloadError::Magic
        ));
    }
}
