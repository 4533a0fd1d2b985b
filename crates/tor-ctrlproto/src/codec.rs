//! Framing for the control protocol, for use with the asynchronous_codec
//! crate.
//!
//! Each wire line is `CCCSP...P\r\n`: a 3-digit status, a separator in
//! `{' ', '-', '+'}`, and a payload.  A `+` separator opens a multi-line
//! body that runs until a lone `.` line; the body is attached to the
//! header line rather than surfaced as separate items.

use asynchronous_codec as futures_codec;
use bytes::BytesMut;

use crate::msg::ReplyLine;
use crate::{Error, Result};

/// Codec turning a byte stream into [`ReplyLine`]s and command strings
/// into wire bytes.
///
/// This type lets us wrap the control-port connection as a Sink and a
/// Stream of decoded lines, so the reactor can forget about
/// byte-oriented communication.
#[derive(Debug, Default)]
pub struct ControlCodec {
    /// A `+`-separated header line whose body we are still collecting.
    partial: Option<PartialBody>,
}

/// Accumulator for a multi-line body in progress.
#[derive(Debug)]
struct PartialBody {
    /// Status code of the header line.
    status: u16,
    /// Payload of the header line.
    payload: String,
    /// Body lines collected so far.
    body: Vec<String>,
}

/// Pull one CRLF-terminated line out of `src`, if a complete one is
/// buffered.  Returns the line without its terminator.
fn take_line(src: &mut BytesMut) -> Result<Option<String>> {
    let Some(nl) = src.iter().position(|b| *b == b'\n') else {
        return Ok(None);
    };
    let mut line = src.split_to(nl + 1);
    // Drop the '\n', and the '\r' before it if present.
    line.truncate(nl);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    let text = std::str::from_utf8(&line)
        .map_err(|_| Error::MalformedFrame("line is not valid UTF-8".into()))?;
    Ok(Some(text.to_owned()))
}

/// Parse the status code and separator of a header line.
fn parse_header(line: &str) -> Result<(u16, char, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 4 {
        return Err(Error::MalformedFrame(format!("truncated line {:?}", line)));
    }
    if !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(Error::MalformedFrame(format!(
            "non-numeric status in {:?}",
            line
        )));
    }
    let status: u16 = line[..3]
        .parse()
        .map_err(|_| Error::MalformedFrame(format!("bad status in {:?}", line)))?;
    let sep = char::from(bytes[3]);
    if !matches!(sep, ' ' | '-' | '+') {
        return Err(Error::MalformedFrame(format!(
            "bad separator {:?} in {:?}",
            sep, line
        )));
    }
    Ok((status, sep, &line[4..]))
}

impl futures_codec::Decoder for ControlCodec {
    type Item = ReplyLine;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ReplyLine>> {
        loop {
            let Some(line) = take_line(src)? else {
                return Ok(None);
            };
            if let Some(mut partial) = self.partial.take() {
                if line == "." {
                    return Ok(Some(ReplyLine {
                        status: partial.status,
                        end: false,
                        payload: partial.payload,
                        data: Some(partial.body.join("\n")),
                    }));
                }
                // A body line beginning with '.' is transmitted dot-stuffed.
                let line = line.strip_prefix('.').map(str::to_owned).unwrap_or(line);
                partial.body.push(line);
                self.partial = Some(partial);
                continue;
            }

            let (status, sep, payload) = parse_header(&line)?;
            match sep {
                '+' => {
                    self.partial = Some(PartialBody {
                        status,
                        payload: payload.to_owned(),
                        body: Vec::new(),
                    });
                    continue;
                }
                '-' => {
                    return Ok(Some(ReplyLine {
                        status,
                        end: false,
                        payload: payload.to_owned(),
                        data: None,
                    }));
                }
                _ => {
                    return Ok(Some(ReplyLine {
                        status,
                        end: true,
                        payload: payload.to_owned(),
                        data: None,
                    }));
                }
            }
        }
    }
}

impl futures_codec::Encoder for ControlCodec {
    type Item<'a> = String;
    type Error = Error;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<()> {
        if item.contains('\r') || item.contains('\n') {
            return Err(Error::Internal("command text contains a line break"));
        }
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use asynchronous_codec::{Decoder, Encoder};

    /// Decode everything currently in `buf`.
    fn drain(codec: &mut ControlCodec, buf: &mut BytesMut) -> Vec<ReplyLine> {
        let mut out = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn simple_reply() {
        let mut codec = ControlCodec::default();
        let mut buf = BytesMut::from(&b"250-version=0.2.3.25\r\n250 OK\r\n"[..]);
        let lines = drain(&mut codec, &mut buf);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].status, 250);
        assert!(!lines[0].end);
        assert_eq!(lines[0].payload, "version=0.2.3.25");
        assert!(lines[1].end);
        assert_eq!(lines[1].payload, "OK");
        assert!(buf.is_empty());
    }

    #[test]
    fn multiline_body() {
        let mut codec = ControlCodec::default();
        let mut buf = BytesMut::from(
            &b"250+ns/name/moria1=\r\nr moria1 aaaa\r\ns Fast Guard\r\n.\r\n250 OK\r\n"[..],
        );
        let lines = drain(&mut codec, &mut buf);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].payload, "ns/name/moria1=");
        assert_eq!(
            lines[0].data.as_deref(),
            Some("r moria1 aaaa\ns Fast Guard")
        );
        assert!(!lines[0].end);
        assert!(lines[1].end);
    }

    #[test]
    fn dot_stuffing() {
        let mut codec = ControlCodec::default();
        let mut buf = BytesMut::from(&b"250+k=\r\n..leading dot\r\n.\r\n250 OK\r\n"[..]);
        let lines = drain(&mut codec, &mut buf);
        assert_eq!(lines[0].data.as_deref(), Some(".leading dot"));
    }

    #[test]
    fn partial_input_restartable() {
        let mut codec = ControlCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"650 CIRC 42 LAUN");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"CHED\r\n25");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line.status, 650);
        assert_eq!(line.payload, "CIRC 42 LAUNCHED");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"0 OK\r\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line.status, 250);
    }

    #[test]
    fn partial_multiline_restartable() {
        let mut codec = ControlCodec::default();
        let mut buf = BytesMut::from(&b"250+k=\r\nline one\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"line two\r\n.\r\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(line.data.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn malformed_lines() {
        for bad in [&b"25 OK\r\n"[..], b"xyz OK\r\n", b"250?OK\r\n", b"2\r\n"] {
            let mut codec = ControlCodec::default();
            let mut buf = BytesMut::from(bad);
            let err = codec.decode(&mut buf).unwrap_err();
            assert!(matches!(err, Error::MalformedFrame(_)), "{:?}", bad);
        }
    }

    #[test]
    fn non_utf8() {
        let mut codec = ControlCodec::default();
        let mut buf = BytesMut::from(&b"250 \xff\xfe\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = ControlCodec::default();
        let mut buf = BytesMut::new();
        codec.encode("GETINFO version".to_owned(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"GETINFO version\r\n");

        let err = codec
            .encode("bad\r\ncommand".to_owned(), &mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
