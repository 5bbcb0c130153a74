//! Classification of user input into local paths and remote URLs

use std::fmt;
use std::path::PathBuf;

use url::{ParseError, Url};

use crate::error::{CogError, CogResult};

/// Where a raster lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterLocation {
    LocalPath(PathBuf),
    RemoteUrl(Url),
}

impl RasterLocation {
    /// Classify `input` without touching the filesystem or the network.
    ///
    /// - no scheme: local path (backslashes are rejected outside Windows)
    /// - `http`/`https`: remote URL
    /// - `file://`: local path
    /// - single letter scheme such as `C:`: Windows drive, local path
    /// - any other scheme: [`CogError::InvalidUrl`]
    pub fn parse(input: &str) -> CogResult<Self> {
        if input.trim().is_empty() || input.contains('\0') {
            return Err(CogError::InvalidPath(input.to_string()));
        }

        match Url::parse(input) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(Self::RemoteUrl(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::LocalPath)
                    .map_err(|()| CogError::InvalidPath(input.to_string())),
                scheme if is_drive_letter(scheme, input) => local_path(input),
                _ => Err(CogError::InvalidUrl(input.to_string())),
            },
            Err(ParseError::RelativeUrlWithoutBase) => local_path(input),
            Err(_) => Err(CogError::InvalidPath(input.to_string())),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteUrl(_))
    }
}

impl fmt::Display for RasterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalPath(path) => write!(f, "{}", path.display()),
            Self::RemoteUrl(url) => write!(f, "{url}"),
        }
    }
}

impl std::str::FromStr for RasterLocation {
    type Err = CogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn is_drive_letter(scheme: &str, input: &str) -> bool {
    scheme.len() == 1 && input.as_bytes().get(1) == Some(&b':')
}

fn local_path(input: &str) -> CogResult<RasterLocation> {
    if cfg!(not(windows)) && input.contains('\\') {
        return Err(CogError::InvalidPath(input.to_string()));
    }
    Ok(RasterLocation::LocalPath(PathBuf::from(input)))
}
