use crate::error::ProtocolError;
use bytes::Bytes;
use memchr::memchr;

/// Upper bound on a single bulk-string payload.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Upper bound on the number of elements in a request array.
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Outcome of one parse attempt over buffered input.
#[derive(Debug)]
pub enum ParseResult {
    /// A complete command: its arguments and how many input bytes it
    /// occupied. An empty argument vector (blank inline line, `*0`)
    /// should be consumed and skipped.
    Complete { args: Vec<Bytes>, consumed: usize },
    /// More input is required. When the missing amount is knowable from
    /// a declared length, `hint` is the total input size that will make
    /// the command parseable; the reader sizes its buffer to it.
    Incomplete { hint: Option<usize> },
}

/// Parse one command from `input`.
///
/// Requests are either multibulk arrays of bulk strings
/// (`*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n`) or the inline form (a single
/// whitespace-separated line). Replies are never parsed here; this is
/// the request side only.
pub fn parse_command(input: &[u8]) -> Result<ParseResult, ProtocolError> {
    if input.is_empty() {
        return Ok(ParseResult::Incomplete { hint: None });
    }

    if input[0] == b'*' {
        parse_multibulk(input)
    } else {
        parse_inline(input)
    }
}

fn parse_multibulk(input: &[u8]) -> Result<ParseResult, ProtocolError> {
    let (count, mut pos) = match parse_len_line(input, 0, ProtocolError::BadArrayLen)? {
        Some(v) => v,
        None => return Ok(ParseResult::Incomplete { hint: None }),
    };

    if count < 0 || count as usize > MAX_ARRAY_LEN {
        return Err(ProtocolError::BadArrayLen);
    }

    let count = count as usize;
    let mut args = Vec::with_capacity(count);

    for _ in 0..count {
        if pos >= input.len() {
            return Ok(ParseResult::Incomplete { hint: None });
        }
        if input[pos] != b'$' {
            return Err(ProtocolError::BadBulkLen);
        }

        let (len, data_start) = match parse_len_line(input, pos, ProtocolError::BadBulkLen)? {
            Some(v) => v,
            None => return Ok(ParseResult::Incomplete { hint: None }),
        };

        if len < 0 || len as usize > MAX_BULK_LEN {
            return Err(ProtocolError::BadBulkLen);
        }

        let len = len as usize;
        let data_end = data_start + len;

        if input.len() < data_end + 2 {
            // The declared length tells us exactly how much buffer the
            // current element needs.
            return Ok(ParseResult::Incomplete {
                hint: Some(data_end + 2),
            });
        }

        if &input[data_end..data_end + 2] != b"\r\n" {
            return Err(ProtocolError::BadBulkLen);
        }

        args.push(Bytes::copy_from_slice(&input[data_start..data_end]));
        pos = data_end + 2;
    }

    Ok(ParseResult::Complete {
        args,
        consumed: pos,
    })
}

/// Inline commands: one line, whitespace-separated tokens.
fn parse_inline(input: &[u8]) -> Result<ParseResult, ProtocolError> {
    let nl = match memchr(b'\n', input) {
        Some(pos) => pos,
        None => return Ok(ParseResult::Incomplete { hint: None }),
    };

    let mut line = &input[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }

    let args = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|tok| !tok.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();

    Ok(ParseResult::Complete {
        args,
        consumed: nl + 1,
    })
}

/// Parse `<type-byte><decimal>\r\n` starting at `pos`; returns the
/// value and the offset just past the CRLF, or `None` when the line is
/// still incomplete.
fn parse_len_line(
    input: &[u8],
    pos: usize,
    err: ProtocolError,
) -> Result<Option<(i64, usize)>, ProtocolError> {
    let nl = match memchr(b'\n', &input[pos..]) {
        Some(rel) => pos + rel,
        None => return Ok(None),
    };

    if nl == pos + 1 || input[nl - 1] != b'\r' {
        return Err(err);
    }

    let digits = &input[pos + 1..nl - 1];
    if digits.is_empty() {
        return Err(err);
    }

    let mut value: i64 = 0;
    let (digits, sign) = if digits[0] == b'-' {
        (&digits[1..], -1)
    } else {
        (digits, 1)
    };
    if digits.is_empty() {
        return Err(err);
    }
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(err);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as i64))
            .ok_or(err)?;
    }

    Ok(Some((sign * value, nl + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(input: &[u8]) -> (Vec<Bytes>, usize) {
        match parse_command(input).expect("should parse") {
            ParseResult::Complete { args, consumed } => (args, consumed),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn parses_multibulk_command() {
        let (args, consumed) = complete(b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n");
        assert_eq!(args.len(), 2);
        assert_eq!(&args[0][..], b"ECHO");
        assert_eq!(&args[1][..], b"hi");
        assert_eq!(consumed, 22);
    }

    #[test]
    fn parses_inline_command() {
        let (args, consumed) = complete(b"PING\r\n");
        assert_eq!(args.len(), 1);
        assert_eq!(&args[0][..], b"PING");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn inline_splits_on_whitespace() {
        let (args, _) = complete(b"SET  key   value\r\n");
        assert_eq!(args.len(), 3);
        assert_eq!(&args[2][..], b"value");
    }

    #[test]
    fn blank_inline_line_yields_no_args() {
        let (args, consumed) = complete(b"\r\n");
        assert!(args.is_empty());
        assert_eq!(consumed, 2);
    }

    #[test]
    fn pipelined_commands_parse_one_at_a_time() {
        let input = b"PING\r\nPING\r\nPING\r\n";
        let (args, consumed) = complete(input);
        assert_eq!(&args[0][..], b"PING");
        assert_eq!(consumed, 6);
        let (args, _) = complete(&input[consumed..]);
        assert_eq!(&args[0][..], b"PING");
    }

    #[test]
    fn incomplete_array_header() {
        assert!(matches!(
            parse_command(b"*2\r").unwrap(),
            ParseResult::Incomplete { hint: None }
        ));
    }

    #[test]
    fn incomplete_bulk_reports_length_hint() {
        // $5 at offset 4: data starts at 8, needs 5 + CRLF
        match parse_command(b"*1\r\n$5\r\nhel").unwrap() {
            ParseResult::Incomplete { hint } => assert_eq!(hint, Some(15)),
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn negative_array_len_is_protocol_error() {
        assert_eq!(
            parse_command(b"*-1\r\n").unwrap_err(),
            ProtocolError::BadArrayLen
        );
    }

    #[test]
    fn negative_bulk_len_is_protocol_error() {
        assert_eq!(
            parse_command(b"*1\r\n$-1\r\n").unwrap_err(),
            ProtocolError::BadBulkLen
        );
    }

    #[test]
    fn non_bulk_array_element_is_protocol_error() {
        assert_eq!(
            parse_command(b"*1\r\n:5\r\n").unwrap_err(),
            ProtocolError::BadBulkLen
        );
    }

    #[test]
    fn missing_crlf_after_bulk_is_protocol_error() {
        assert_eq!(
            parse_command(b"*1\r\n$2\r\nhiXX").unwrap_err(),
            ProtocolError::BadBulkLen
        );
    }

    #[test]
    fn oversized_array_is_protocol_error() {
        let input = format!("*{}\r\n", MAX_ARRAY_LEN + 1);
        assert_eq!(
            parse_command(input.as_bytes()).unwrap_err(),
            ProtocolError::BadArrayLen
        );
    }
}
