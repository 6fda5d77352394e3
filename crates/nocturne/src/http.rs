// src/http.rs
use std::path::Path;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
    Unknown,
}

impl Method {
    /// Exact, case-sensitive token match.
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            b"PATCH" => Method::Patch,
            b"HEAD" => Method::Head,
            b"OPTIONS" => Method::Options,
            b"TRACE" => Method::Trace,
            b"CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }
}

/// The fixed set of statuses this server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::InternalError => 500,
        }
    }

    pub fn status_line(self) -> &'static [u8] {
        match self {
            StatusCode::Ok => b"HTTP/1.1 200 OK\r\n",
            StatusCode::BadRequest => b"HTTP/1.1 400 Bad Request\r\n",
            StatusCode::Forbidden => b"HTTP/1.1 403 Forbidden\r\n",
            StatusCode::NotFound => b"HTTP/1.1 404 Not Found\r\n",
            StatusCode::InternalError => b"HTTP/1.1 500 Internal Error\r\n",
        }
    }

    /// Body sent with a failure status. Empty for 200.
    pub fn error_body(self) -> &'static [u8] {
        match self {
            StatusCode::Ok => b"",
            StatusCode::BadRequest => {
                b"Your request has bad syntax or is inherently impossible to satisfy.\n"
            }
            StatusCode::Forbidden => b"You do not have permission to get file from this server.\n",
            StatusCode::NotFound => b"The requested file was not found on this server.\n",
            StatusCode::InternalError => {
                b"There was an unusual problem serving the requested file.\n"
            }
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Content type guessed from a file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

pub const ERROR_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// The response head did not fit into the connection's write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadOverflow;

/// Writes a response head into a fixed-capacity buffer without allocating.
pub struct HeadWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> HeadWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn push(&mut self, bytes: &[u8]) -> Result<(), HeadOverflow> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(HeadOverflow);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn status(&mut self, code: StatusCode) -> Result<(), HeadOverflow> {
        self.push(code.status_line())
    }

    pub fn header(&mut self, name: &str, value: &[u8]) -> Result<(), HeadOverflow> {
        self.push(name.as_bytes())?;
        self.push(b": ")?;
        self.push(value)?;
        self.push(b"\r\n")
    }

    pub fn content_length(&mut self, len: usize) -> Result<(), HeadOverflow> {
        let mut itoa_buf = itoa::Buffer::new();
        let digits = itoa_buf.format(len);
        self.header("Content-Length", digits.as_bytes())
    }

    pub fn connection(&mut self, keep_alive: bool) -> Result<(), HeadOverflow> {
        if keep_alive {
            self.push(b"Connection: keep-alive\r\n")
        } else {
            self.push(b"Connection: close\r\n")
        }
    }

    pub fn date(&mut self, now: SystemTime) -> Result<(), HeadOverflow> {
        let date = httpdate::fmt_http_date(now);
        self.header("Date", date.as_bytes())
    }

    /// Terminate the head and return its total length.
    pub fn finish(mut self) -> Result<usize, HeadOverflow> {
        self.push(b"\r\n")?;
        Ok(self.pos)
    }
}

/// Fill `buf` with a complete response head.
pub fn write_head(
    buf: &mut [u8],
    code: StatusCode,
    content_type: &str,
    content_length: usize,
    keep_alive: bool,
) -> Result<usize, HeadOverflow> {
    let mut w = HeadWriter::new(buf);
    w.status(code)?;
    w.header("Server", b"nocturne")?;
    w.date(SystemTime::now())?;
    w.header("Content-Type", content_type.as_bytes())?;
    w.content_length(content_length)?;
    w.connection(keep_alive)?;
    w.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_is_case_sensitive() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"get"), Method::Unknown);
        assert_eq!(Method::from_bytes(b"POST"), Method::Post);
    }

    #[test]
    fn test_write_head_layout() {
        let mut buf = [0u8; 512];
        let n = write_head(&mut buf, StatusCode::NotFound, ERROR_CONTENT_TYPE, 49, false).unwrap();
        let head = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("\r\nContent-Length: 49\r\n"));
        assert!(head.contains("\r\nConnection: close\r\n"));
        assert!(head.contains("\r\nDate: "));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_write_head_overflow() {
        let mut buf = [0u8; 32];
        assert_eq!(
            write_head(&mut buf, StatusCode::Ok, "text/html", 10, true),
            Err(HeadOverflow)
        );
    }

    #[test]
    fn test_error_body_matches_status() {
        assert_eq!(
            StatusCode::NotFound.error_body(),
            b"The requested file was not found on this server.\n"
        );
        assert!(StatusCode::Ok.error_body().is_empty());
        assert_eq!(StatusCode::InternalError.as_u16(), 500);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a/index.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("logo.png")), "image/png");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }
}
