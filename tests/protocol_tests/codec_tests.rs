//! Codec Tests
//!
//! Tests for command encoding and incremental reply parsing.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use memcast::protocol::{
    encode_command, read_reply, validate_key, write_command, Command, Item, Reply, ReplyParser,
    StoreMode,
};
use memcast::Error;

fn parse_all(input: &[u8]) -> Vec<Reply> {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::from(input);
    let mut replies = Vec::new();
    while let Some(reply) = parser.parse(&mut buf).unwrap() {
        replies.push(reply);
    }
    assert!(buf.is_empty(), "unconsumed input: {:?}", buf);
    replies
}

fn item(key: &str, flags: u32, data: &[u8]) -> Item {
    Item {
        key: key.to_string(),
        flags,
        data: Bytes::copy_from_slice(data),
        cas: None,
    }
}

// =============================================================================
// Command Encoding Tests
// =============================================================================

#[test]
fn test_encode_set() {
    let cmd = Command::Store {
        mode: StoreMode::Set,
        key: "greeting".to_string(),
        flags: 0,
        exptime: 60,
        data: Bytes::from_static(b"hello"),
    };
    assert_eq!(&encode_command(&cmd)[..], b"set greeting 0 60 5\r\nhello\r\n");
}

#[test]
fn test_encode_every_store_mode() {
    let cases = [
        (StoreMode::Add, "add"),
        (StoreMode::Replace, "replace"),
        (StoreMode::Append, "append"),
        (StoreMode::Prepend, "prepend"),
    ];
    for (mode, verb) in cases {
        let cmd = Command::Store {
            mode,
            key: "k".to_string(),
            flags: 8,
            exptime: 0,
            data: Bytes::from_static(b"42"),
        };
        let expected = format!("{} k 8 0 2\r\n42\r\n", verb);
        assert_eq!(&encode_command(&cmd)[..], expected.as_bytes());
    }
}

#[test]
fn test_encode_set_with_crlf_in_data() {
    let cmd = Command::Store {
        mode: StoreMode::Set,
        key: "k".to_string(),
        flags: 4,
        exptime: 0,
        data: Bytes::from_static(b"a\r\nb"),
    };
    assert_eq!(&encode_command(&cmd)[..], b"set k 4 0 4\r\na\r\nb\r\n");
}

#[test]
fn test_encode_get_multiple_keys() {
    let cmd = Command::Get {
        keys: vec!["a".to_string(), "b".to_string(), "c".to_string()],
    };
    assert_eq!(&encode_command(&cmd)[..], b"get a b c\r\n");
}

#[test]
fn test_encode_simple_commands() {
    let cases: Vec<(Command, &[u8])> = vec![
        (Command::Delete { key: "k".to_string() }, &b"delete k\r\n"[..]),
        (Command::Incr { key: "n".to_string(), delta: 5 }, &b"incr n 5\r\n"[..]),
        (Command::Decr { key: "n".to_string(), delta: 2 }, &b"decr n 2\r\n"[..]),
        (Command::Touch { key: "k".to_string(), exptime: 30 }, &b"touch k 30\r\n"[..]),
        (Command::Version, &b"version\r\n"[..]),
        (Command::FlushAll { delay: None }, &b"flush_all\r\n"[..]),
        (Command::FlushAll { delay: Some(10) }, &b"flush_all 10\r\n"[..]),
    ];
    for (cmd, expected) in cases {
        assert_eq!(&encode_command(&cmd)[..], expected, "{:?}", cmd);
    }
}

// =============================================================================
// Reply Parsing Tests
// =============================================================================

#[test]
fn test_parse_single_line_replies() {
    let replies = parse_all(
        b"STORED\r\nNOT_STORED\r\nEXISTS\r\nNOT_FOUND\r\nDELETED\r\nTOUCHED\r\nOK\r\n",
    );
    assert_eq!(
        replies,
        vec![
            Reply::Stored,
            Reply::NotStored,
            Reply::Exists,
            Reply::NotFound,
            Reply::Deleted,
            Reply::Touched,
            Reply::Ok,
        ]
    );
}

#[test]
fn test_parse_counter_and_version() {
    let replies = parse_all(b"42\r\nVERSION 1.6.21\r\n");
    assert_eq!(replies, vec![Reply::Number(42), Reply::Version("1.6.21".to_string())]);
}

#[test]
fn test_parse_error_lines() {
    let replies = parse_all(b"ERROR\r\nCLIENT_ERROR bad data chunk\r\nSERVER_ERROR out of memory\r\n");
    assert_eq!(
        replies,
        vec![
            Reply::Error,
            Reply::ClientError("bad data chunk".to_string()),
            Reply::ServerError("out of memory".to_string()),
        ]
    );
}

#[test]
fn test_parse_empty_retrieval() {
    assert_eq!(parse_all(b"END\r\n"), vec![Reply::Values(vec![])]);
}

#[test]
fn test_parse_multiple_values() {
    let replies = parse_all(b"VALUE a 0 1\r\n1\r\nVALUE b 2 7\r\n{\"x\":1}\r\nEND\r\n");
    assert_eq!(
        replies,
        vec![Reply::Values(vec![item("a", 0, b"1"), item("b", 2, b"{\"x\":1}")])]
    );
}

#[test]
fn test_parse_value_with_cas() {
    let replies = parse_all(b"VALUE a 0 1 99\r\nz\r\nEND\r\n");
    let Reply::Values(items) = &replies[0] else {
        panic!("Expected VALUE reply");
    };
    assert_eq!(items[0].cas, Some(99));
}

#[test]
fn test_parse_data_containing_crlf_and_end() {
    let replies = parse_all(b"VALUE k 4 9\r\nEND\r\nEND\r\r\nEND\r\n");
    assert_eq!(replies, vec![Reply::Values(vec![item("k", 4, b"END\r\nEND\r")])]);
}

#[test]
fn test_parse_byte_at_a_time() {
    let input = b"STORED\r\nVALUE k 0 5\r\nhello\r\nEND\r\n7\r\n";
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::new();
    let mut replies = Vec::new();

    for byte in input.iter() {
        buf.extend_from_slice(&[*byte]);
        while let Some(reply) = parser.parse(&mut buf).unwrap() {
            replies.push(reply);
        }
    }

    assert_eq!(
        replies,
        vec![
            Reply::Stored,
            Reply::Values(vec![item("k", 0, b"hello")]),
            Reply::Number(7),
        ]
    );
}

#[test]
fn test_parse_split_inside_data_block() {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::from(&b"VALUE k 0 10\r\n01234"[..]);

    assert_eq!(parser.parse(&mut buf).unwrap(), None);

    buf.extend_from_slice(b"56789\r\nEN");
    assert_eq!(parser.parse(&mut buf).unwrap(), None);
    assert!(parser.in_progress());

    buf.extend_from_slice(b"D\r\n");
    assert_eq!(
        parser.parse(&mut buf).unwrap(),
        Some(Reply::Values(vec![item("k", 0, b"0123456789")]))
    );
    assert!(!parser.in_progress());
}

#[test]
fn test_parse_incomplete_returns_none() {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::from(&b"STOR"[..]);
    assert_eq!(parser.parse(&mut buf).unwrap(), None);
    assert_eq!(&buf[..], b"STOR");
}

// =============================================================================
// Malformed Reply Tests
// =============================================================================

#[test]
fn test_parse_unknown_line() {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::from(&b"WHAT\r\n"[..]);
    assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
}

#[test]
fn test_parse_malformed_value_header() {
    for input in [
        &b"VALUE k\r\n"[..],
        b"VALUE k x 1\r\n",
        b"VALUE k 0 -1\r\n",
        b"VALUE k 0 1 2 3\r\n",
    ] {
        let mut parser = ReplyParser::new();
        let mut buf = BytesMut::from(input);
        assert!(
            matches!(parser.parse(&mut buf), Err(Error::Protocol(_))),
            "{:?}",
            String::from_utf8_lossy(input)
        );
    }
}

#[test]
fn test_parse_oversized_value_length() {
    let huge = format!("VALUE k 0 {}\r\n", usize::MAX);
    let too_big = format!("VALUE k 0 {}\r\n", memcast::protocol::MAX_DATA_LENGTH + 1);
    for input in [huge, too_big] {
        let mut parser = ReplyParser::new();
        let mut buf = BytesMut::from(input.as_bytes());
        assert!(
            matches!(parser.parse(&mut buf), Err(Error::Protocol(_))),
            "{:?}",
            input
        );
        assert!(!parser.in_progress());
    }
}

#[test]
fn test_parse_oversized_value_after_first_block() {
    let mut parser = ReplyParser::new();
    let input = format!("VALUE a 0 1\r\nx\r\nVALUE b 0 {}\r\n", usize::MAX);
    let mut buf = BytesMut::from(input.as_bytes());
    assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    assert!(!parser.in_progress());
}

#[test]
fn test_parse_data_block_without_terminator() {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::from(&b"VALUE k 0 2\r\nabcd\r\nEND\r\n"[..]);
    assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
    assert!(!parser.in_progress());
}

#[test]
fn test_parse_status_inside_retrieval() {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::from(&b"VALUE k 0 1\r\na\r\nSTORED\r\n"[..]);
    assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
}

#[test]
fn test_parse_overlong_line() {
    let mut parser = ReplyParser::new();
    let mut buf = BytesMut::from(&vec![b'A'; memcast::protocol::MAX_LINE_LENGTH + 1][..]);
    assert!(matches!(parser.parse(&mut buf), Err(Error::Protocol(_))));
}

#[test]
fn test_error_replies_map_to_error_kinds() {
    assert!(matches!(Reply::Error.into_result(), Err(Error::Client(_))));
    assert!(matches!(
        Reply::ClientError("bad command line format".to_string()).into_result(),
        Err(Error::Client(_))
    ));
    assert!(matches!(
        Reply::ServerError("object too large for cache".to_string()).into_result(),
        Err(Error::ValueTooLarge(_))
    ));
    assert!(matches!(
        Reply::ServerError("out of memory storing object".to_string()).into_result(),
        Err(Error::Server(_))
    ));
    assert_eq!(Reply::Stored.into_result(), Ok(Reply::Stored));
}

// =============================================================================
// Key Validation Tests
// =============================================================================

#[test]
fn test_validate_key() {
    assert!(validate_key("user:42", 250).is_ok());
    assert!(validate_key(&"k".repeat(250), 250).is_ok());

    for bad in ["", "has space", "tab\there", "new\nline", "\u{7f}"] {
        assert!(
            matches!(validate_key(bad, 250), Err(Error::InvalidKey(_))),
            "{:?}",
            bad
        );
    }
    assert!(matches!(validate_key(&"k".repeat(251), 250), Err(Error::InvalidKey(_))));
}

#[test]
fn test_validate_key_accepts_utf8() {
    assert!(validate_key("ключ", 250).is_ok());
}

// =============================================================================
// Stream I/O Tests
// =============================================================================

#[test]
fn test_stream_helpers() {
    let mut out = Vec::new();
    write_command(&mut out, &Command::Version).unwrap();
    assert_eq!(out, b"version\r\n");

    let mut input = Cursor::new(b"VERSION 1.6.21\r\n".to_vec());
    assert_eq!(read_reply(&mut input).unwrap(), Reply::Version("1.6.21".to_string()));
}

#[test]
fn test_read_reply_on_truncated_stream() {
    let mut input = Cursor::new(b"VALUE k 0 5\r\nhel".to_vec());
    assert!(matches!(read_reply(&mut input), Err(Error::Connectivity(_))));
}
