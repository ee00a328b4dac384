//! File extension → MIME type lookup, read-only after startup.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mime {
    Aac,
    Arc,
    OctetStream,
    Bmp,
    Css,
    Csv,
    Gif,
    Html,
    Ico,
    Ics,
    Jpeg,
    Js,
    Json,
    Mp3,
    Png,
    Pdf,
    Sh,
    Tar,
    Txt,
    Xhtml,
    Xml,
    Zip,
}

impl Mime {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aac => "audio/aac",
            Self::Arc => "application/x-freearc",
            Self::OctetStream => "application/octet-stream",
            Self::Bmp => "image/bmp",
            Self::Css => "text/css",
            Self::Csv => "text/csv",
            Self::Gif => "image/gif",
            Self::Html => "text/html",
            Self::Ico => "image/vnd.microsoft.icon",
            Self::Ics => "text/calendar",
            Self::Jpeg => "image/jpeg",
            Self::Js => "text/javascript",
            Self::Json => "application/json",
            Self::Mp3 => "audio/mpeg",
            Self::Png => "image/png",
            Self::Pdf => "application/pdf",
            Self::Sh => "application/x-sh",
            Self::Tar => "application/x-tar",
            Self::Txt => "text/plain",
            Self::Xhtml => "application/xhtml+xml",
            Self::Xml => "application/xml",
            Self::Zip => "application/zip",
        }
    }
}

pub struct MimeMap {
    by_ext: HashMap<&'static str, Mime>,
}

impl MimeMap {
    pub fn new() -> Self {
        let by_ext = HashMap::from([
            ("aac", Mime::Aac),
            ("arc", Mime::Arc),
            ("bin", Mime::OctetStream),
            ("bmp", Mime::Bmp),
            ("css", Mime::Css),
            ("csv", Mime::Csv),
            ("gif", Mime::Gif),
            ("html", Mime::Html),
            ("ico", Mime::Ico),
            ("ics", Mime::Ics),
            ("jpg", Mime::Jpeg),
            ("jpeg", Mime::Jpeg),
            ("js", Mime::Js),
            ("json", Mime::Json),
            ("mjs", Mime::Js),
            ("mp3", Mime::Mp3),
            ("png", Mime::Png),
            ("pdf", Mime::Pdf),
            ("sh", Mime::Sh),
            ("tar", Mime::Tar),
            ("txt", Mime::Txt),
            ("xhtml", Mime::Xhtml),
            ("xml", Mime::Xml),
            ("zip", Mime::Zip),
        ]);
        Self { by_ext }
    }

    /// Unrecognized extensions fall back to `application/octet-stream`.
    pub fn lookup(&self, ext: &str) -> Mime {
        self.by_ext.get(ext).copied().unwrap_or(Mime::OctetStream)
    }
}

impl Default for MimeMap {
    fn default() -> Self {
        Self::new()
    }
}
