//! Record-separator framing for text protocols.
//!
//! Every record is terminated by [`RECORD_SEPARATOR`]; a single transport
//! payload may carry several records back to back.

use crate::constants::RECORD_SEPARATOR;
use crate::error::HubError;

/// Terminate `record` with the record separator.
#[must_use]
pub fn write(record: &str) -> String {
    let mut framed = String::with_capacity(record.len() + 1);
    framed.push_str(record);
    framed.push(RECORD_SEPARATOR);
    framed
}

/// Split a framed payload into its records.
///
/// The input must end with a separator; a trailing partial record means the
/// payload was cut and is rejected as [`HubError::InvalidData`].
pub fn parse(input: &str) -> Result<Vec<&str>, HubError> {
    let Some(body) = input.strip_suffix(RECORD_SEPARATOR) else {
        return Err(HubError::InvalidData("Message is incomplete.".to_string()));
    };
    Ok(body.split(RECORD_SEPARATOR).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_appends_separator() {
        assert_eq!(write("{}"), "{}\u{1e}");
    }

    #[test]
    fn test_parse_multiple_records() {
        let records = parse("{\"a\":1}\u{1e}{\"b\":2}\u{1e}").unwrap();
        assert_eq!(records, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_parse_rejects_unterminated_input() {
        let err = parse("{\"a\":1}\u{1e}{\"b\"").unwrap_err();
        assert_eq!(err, HubError::InvalidData("Message is incomplete.".to_string()));
    }
}
