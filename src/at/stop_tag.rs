use crate::{
    codecs::lines::trim,
    error::{DeviceError, DeviceErrorKind},
};

/// A line which ends a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StopTag {
    Ok,
    Error(DeviceError),
}

impl StopTag {
    /// Whether `text` (trimmed) is a stop tag, and which.
    pub(crate) fn parse(text: &[u8]) -> Option<Self> {
        let error = |kind, rest: &[u8]| {
            let text = String::from_utf8_lossy(trim(rest)).into_owned();
            Some(Self::Error(DeviceError {
                kind,
                code: text.parse().ok(),
                text,
            }))
        };

        match text {
            b"OK" => Some(Self::Ok),
            b"ERROR" => error(DeviceErrorKind::Plain, b""),
            b"ABORTED" => error(DeviceErrorKind::Aborted, b""),
            _ => {
                if let Some(rest) = text.strip_prefix(b"+CME ERROR:") {
                    error(DeviceErrorKind::Cme, rest)
                } else if let Some(rest) = text.strip_prefix(b"+CMS ERROR:") {
                    error(DeviceErrorKind::Cms, rest)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain() {
        assert_eq!(StopTag::parse(b"OK"), Some(StopTag::Ok));
        assert_eq!(
            StopTag::parse(b"ERROR"),
            Some(StopTag::Error(DeviceError {
                kind: DeviceErrorKind::Plain,
                code: None,
                text: String::new(),
            }))
        );
        assert_eq!(StopTag::parse(b"OKAY"), None);
        assert_eq!(StopTag::parse(b"+CREG: 1"), None);
    }

    #[test]
    fn numeric_cme() {
        assert_eq!(
            StopTag::parse(b"+CME ERROR: 10"),
            Some(StopTag::Error(DeviceError {
                kind: DeviceErrorKind::Cme,
                code: Some(10),
                text: "10".into(),
            }))
        );
    }

    #[test]
    fn verbose_cms() {
        assert_eq!(
            StopTag::parse(b"+CMS ERROR: SIM not inserted"),
            Some(StopTag::Error(DeviceError {
                kind: DeviceErrorKind::Cms,
                code: None,
                text: "SIM not inserted".into(),
            }))
        );
    }
}
