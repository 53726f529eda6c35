use std::fmt;

/// Separator between the fields of a container name.
pub const DYNO_DELIMITER: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DynoParseError {
    #[error("Container name '{0}' does not have exactly four fields")]
    FieldCount(String),
    #[error("Container name '{0}' has an empty field")]
    EmptyField(String),
    #[error("Version field '{0}' is not 'v' followed by a number")]
    Version(String),
    #[error("Instance index '{0}' is not a number")]
    Index(String),
}

/// Logical identity of a container: `<app>_v<version>_<process>_<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynoIdentity {
    pub app: String,
    pub version: u64,
    pub process: String,
    pub index: u32,
}

/// The slot a dyno occupies, shared by every version of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynoSlot<'a> {
    pub app: &'a str,
    pub process: &'a str,
    pub index: u32,
}

/// Digits only, without a sign or leading zeros, so that encoding
/// the parsed value gives back the same text.
fn canonical_number(field: &str) -> Option<u64> {
    if field.is_empty()
        || !field.bytes().all(|b| b.is_ascii_digit())
        || (field.len() > 1 && field.starts_with('0'))
    {
        return None;
    }
    field.parse().ok()
}

impl DynoIdentity {
    pub fn new(app: &str, version: u64, process: &str, index: u32) -> Self {
        Self {
            app: app.to_string(),
            version,
            process: process.to_string(),
            index,
        }
    }

    pub fn parse(name: &str) -> Result<Self, DynoParseError> {
        Self::parse_with(name, DYNO_DELIMITER)
    }

    pub fn parse_with(name: &str, delimiter: char) -> Result<Self, DynoParseError> {
        let fields: Vec<&str> = name.split(delimiter).collect();
        let [app, version, process, index] = fields.as_slice() else {
            return Err(DynoParseError::FieldCount(name.to_string()));
        };
        if app.is_empty() || process.is_empty() {
            return Err(DynoParseError::EmptyField(name.to_string()));
        }

        let version = version
            .strip_prefix('v')
            .and_then(canonical_number)
            .ok_or_else(|| DynoParseError::Version(version.to_string()))?;
        let index = canonical_number(index)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| DynoParseError::Index(index.to_string()))?;

        Ok(Self {
            app: app.to_string(),
            version,
            process: process.to_string(),
            index,
        })
    }

    pub fn encode_with(&self, delimiter: char) -> String {
        format!(
            "{app}{d}v{version}{d}{process}{d}{index}",
            app = self.app,
            version = self.version,
            process = self.process,
            index = self.index,
            d = delimiter
        )
    }

    pub fn slot(&self) -> DynoSlot<'_> {
        DynoSlot {
            app: &self.app,
            process: &self.process,
            index: self.index,
        }
    }
}

impl fmt::Display for DynoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode_with(DYNO_DELIMITER))
    }
}
