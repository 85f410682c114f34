use std::fmt;

use crate::error::{PgWireError, Result};

/// Server runtime parameter announcement (`'S'`), e.g. `server_version = 16.2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl ParameterStatus {
    /// Parse the `cstr name` `cstr value` payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut fields = payload.split(|&b| b == 0);
        let name = fields.next().filter(|s| !s.is_empty());
        let value = fields.next();

        match (name, value) {
            (Some(name), Some(value)) => Ok(Self {
                name: String::from_utf8_lossy(name).into_owned(),
                value: String::from_utf8_lossy(value).into_owned(),
            }),
            _ => Err(PgWireError::Protocol(format!(
                "ParameterStatus payload malformed: {} bytes",
                payload.len()
            ))),
        }
    }
}

impl fmt::Display for ParameterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)
    }
}

/// Fields extracted from an `ErrorResponse` (`'E'`).
///
/// Parsing is total: unknown field codes are skipped and missing fields stay
/// `None` instead of failing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Non-localized severity (`V`), e.g. `ERROR` or `FATAL`.
    pub severity: Option<String>,
    /// SQLSTATE (`C`).
    pub code: Option<String>,
    /// Primary human-readable message (`M`).
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn parse(payload: &[u8]) -> Self {
        // fields: (code_byte, cstring) ... 0
        let mut out = ErrorResponse::default();
        let mut localized_severity = None;
        let mut b = payload;

        while let Some((&code, rest)) = b.split_first() {
            if code == 0 {
                break;
            }
            let (value, tail) = match rest.iter().position(|&x| x == 0) {
                Some(pos) => (&rest[..pos], &rest[pos + 1..]),
                None => (rest, &[][..]),
            };
            let value = String::from_utf8_lossy(value).into_owned();
            match code {
                b'V' => out.severity = Some(value),
                b'S' => localized_severity = Some(value),
                b'C' => out.code = Some(value),
                b'M' => out.message = Some(value),
                _ => {}
            }
            b = tail;
        }

        // Servers older than 9.6 only send the localized severity.
        if out.severity.is_none() {
            out.severity = localized_severity;
        }
        out
    }

    pub fn severity(&self) -> &str {
        self.severity.as_deref().unwrap_or("<no severity>")
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or("<no message>")
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity(), self.message())?;
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {code})")?;
        }
        Ok(())
    }
}
