//! Upload validation.
//!
//! Runs before anything is written to session storage. Checks, in order:
//! filename and extension, size bounds, header decode, dimension bounds,
//! and finally that the sniffed format agrees with the extension.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use image::{ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};

use crate::domain::{Dimensions, ValidationCode, ValidationError, ValidationReport};

use super::paths::{basename, extension_of};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    pub min_file_bytes: u64,
    pub max_file_bytes: u64,
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub allowed_extensions: Vec<String>,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_file_bytes: 1024,
            max_file_bytes: 50 * 1024 * 1024,
            min_dimension: 64,
            max_dimension: 8192,
            allowed_extensions: ["jpg", "jpeg", "png", "tif", "tiff", "bmp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// An upload that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedUpload {
    /// Lowercased, without the dot.
    pub extension: String,
    pub report: ValidationReport,
}

#[derive(Debug, Clone, Default)]
pub struct ImageValidator {
    limits: ValidationLimits,
}

impl ImageValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Filename checks only. Returns the lowercased extension.
    pub fn check_name(&self, original_name: &str) -> Result<String, ValidationError> {
        let base = basename(original_name);
        if base.is_empty() || base.starts_with('.') {
            return Err(ValidationError::new(
                ValidationCode::InvalidFilename,
                format!("unusable filename '{original_name}'"),
            ));
        }
        let Some(ext) = extension_of(base) else {
            return Err(ValidationError::new(
                ValidationCode::InvalidFormat,
                format!("'{base}' has no extension"),
            ));
        };
        if !self.limits.allowed_extensions.iter().any(|a| *a == ext) {
            return Err(ValidationError::new(
                ValidationCode::InvalidFormat,
                format!(
                    "unsupported format '.{ext}', expected one of: {}",
                    self.limits.allowed_extensions.join(", ")
                ),
            ));
        }
        Ok(ext)
    }

    pub fn validate(
        &self,
        original_name: &str,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<AcceptedUpload, ValidationError> {
        let extension = self.check_name(original_name)?;

        let size = bytes.len() as u64;
        if size < self.limits.min_file_bytes {
            return Err(ValidationError::new(
                ValidationCode::FileTooSmall,
                format!(
                    "file is {size} bytes, minimum is {}",
                    self.limits.min_file_bytes
                ),
            ));
        }
        if size > self.limits.max_file_bytes {
            return Err(ValidationError::new(
                ValidationCode::FileTooLarge,
                format!(
                    "file is {size} bytes, maximum is {}",
                    self.limits.max_file_bytes
                ),
            ));
        }

        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ValidationError::new(ValidationCode::CorruptedFile, e.to_string()))?;
        let Some(sniffed) = reader.format() else {
            return Err(ValidationError::new(
                ValidationCode::CorruptedFile,
                "content is not a recognizable image",
            ));
        };
        let (width, height) = reader.into_dimensions().map_err(|e| {
            ValidationError::new(
                ValidationCode::CorruptedFile,
                format!("cannot read image header: {e}"),
            )
        })?;

        let lo = self.limits.min_dimension;
        let hi = self.limits.max_dimension;
        if width < lo || height < lo {
            return Err(ValidationError::new(
                ValidationCode::DimensionsTooSmall,
                format!("{width}x{height} is below minimum {lo}x{lo}"),
            ));
        }
        if width > hi || height > hi {
            return Err(ValidationError::new(
                ValidationCode::DimensionsExceeded,
                format!("{width}x{height} exceeds maximum {hi}x{hi}"),
            ));
        }

        if ImageFormat::from_extension(&extension) != Some(sniffed) {
            return Err(ValidationError::new(
                ValidationCode::InvalidFormat,
                format!("extension '.{extension}' does not match content format {sniffed:?}"),
            ));
        }

        Ok(AcceptedUpload {
            extension,
            report: ValidationReport {
                format: format!("{sniffed:?}").to_ascii_lowercase(),
                dimensions: Dimensions { width, height },
                size_bytes: size,
                checked_at: now,
            },
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{noise_image, png};
    use super::*;
    use rstest::rstest;

    fn validator() -> ImageValidator {
        ImageValidator::default()
    }

    #[test]
    fn accepts_valid_png() {
        let accepted = validator()
            .validate("photo.PNG", &png(128, 96), Utc::now())
            .unwrap();
        assert_eq!(accepted.extension, "png");
        assert_eq!(accepted.report.format, "png");
        assert_eq!(
            accepted.report.dimensions,
            Dimensions {
                width: 128,
                height: 96
            }
        );
    }

    #[test]
    fn accepts_bmp() {
        let bytes = noise_image(64, 64, ImageFormat::Bmp);
        assert!(validator().validate("scan.bmp", &bytes, Utc::now()).is_ok());
    }

    #[rstest]
    #[case::no_ext("photo", ValidationCode::InvalidFormat)]
    #[case::gif("anim.gif", ValidationCode::InvalidFormat)]
    #[case::hidden(".png", ValidationCode::InvalidFilename)]
    #[case::dir_only("uploads/", ValidationCode::InvalidFilename)]
    fn rejects_bad_names(#[case] name: &str, #[case] code: ValidationCode) {
        let err = validator().check_name(name).unwrap_err();
        assert_eq!(err.code, code);
    }

    #[test]
    fn rejects_tiny_file() {
        let err = validator()
            .validate("a.png", &[0x89, b'P', b'N', b'G'], Utc::now())
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::FileTooSmall);
    }

    #[test]
    fn rejects_oversized_file() {
        let limits = ValidationLimits {
            max_file_bytes: 2048,
            ..ValidationLimits::default()
        };
        let err = ImageValidator::new(limits)
            .validate("a.png", &png(128, 128), Utc::now())
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::FileTooLarge);
    }

    #[test]
    fn rejects_garbage_content() {
        let bytes = vec![7u8; 4096];
        let err = validator().validate("a.png", &bytes, Utc::now()).unwrap_err();
        assert_eq!(err.code, ValidationCode::CorruptedFile);
    }

    #[test]
    fn rejects_small_dimensions() {
        // wide enough to clear the byte floor, too short to clear the dimension floor
        let err = validator()
            .validate("a.png", &png(256, 16), Utc::now())
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::DimensionsTooSmall);
    }

    #[test]
    fn rejects_large_dimensions() {
        let limits = ValidationLimits {
            max_dimension: 100,
            ..ValidationLimits::default()
        };
        let err = ImageValidator::new(limits)
            .validate("a.png", &png(128, 64), Utc::now())
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::DimensionsExceeded);
    }

    #[test]
    fn rejects_extension_mismatch() {
        let err = validator()
            .validate("disguised.jpg", &png(64, 64), Utc::now())
            .unwrap_err();
        assert_eq!(err.code, ValidationCode::InvalidFormat);
    }
}
