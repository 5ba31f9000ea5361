//! Compression specifiers, built-in codecs and compression jobs
//!
//! A user-facing [`CompressionOption`] is resolved once, when the sink
//! starts, into a [`Transform`]: a uniform function reference applied to
//! every finalized file. Invalid specifiers are rejected during resolution
//! so no file is ever touched with a bad configuration.

use crate::{path, Error, Result};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// User-supplied post-processing function, receiving the finalized file
pub type CustomTransformFn = Arc<dyn Fn(&Path) -> io::Result<()> + Send + Sync>;

type TransformFn = Arc<dyn Fn(&Path) -> io::Result<Option<PathBuf>> + Send + Sync>;

/// Built-in compression formats, named by the extension they append
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionTag {
    Gz,
    Bz2,
    Zip,
    Xz,
    Lzma,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
}

impl CompressionTag {
    pub const ALL: [CompressionTag; 9] = [
        CompressionTag::Gz,
        CompressionTag::Bz2,
        CompressionTag::Zip,
        CompressionTag::Xz,
        CompressionTag::Lzma,
        CompressionTag::Tar,
        CompressionTag::TarGz,
        CompressionTag::TarBz2,
        CompressionTag::TarXz,
    ];

    /// Extension appended to the finalized file name
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionTag::Gz => "gz",
            CompressionTag::Bz2 => "bz2",
            CompressionTag::Zip => "zip",
            CompressionTag::Xz => "xz",
            CompressionTag::Lzma => "lzma",
            CompressionTag::Tar => "tar",
            CompressionTag::TarGz => "tar.gz",
            CompressionTag::TarBz2 => "tar.bz2",
            CompressionTag::TarXz => "tar.xz",
        }
    }

    /// Whether the format is a tar archive
    pub fn is_archive(&self) -> bool {
        matches!(
            self,
            CompressionTag::Tar
                | CompressionTag::TarGz
                | CompressionTag::TarBz2
                | CompressionTag::TarXz
        )
    }

    /// Compress `source` into `<source>.<ext>` and remove `source`
    ///
    /// An existing artifact is never overwritten: the target is moved to a
    /// free `<source>.<k>.<ext>` name instead.
    pub fn compress(&self, source: &Path) -> io::Result<PathBuf> {
        let target = path::collision_free(source, self.extension());
        self.write_artifact(source, &target)?;

        std::fs::remove_file(source)?;

        tracing::debug!(
            logsink.event = "file_encoded",
            format = self.extension(),
            source = %source.display(),
            target = %target.display(),
            "Finalized log file encoded"
        );

        Ok(target)
    }

    /// Encode `source` into a newly created `target`
    ///
    /// Fails without touching `target` when it already exists. A partial
    /// artifact is removed only if this call created it.
    fn write_artifact(&self, source: &Path, target: &Path) -> io::Result<()> {
        let output = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(target)?;

        if let Err(e) = self.encode(source, output) {
            let _ = std::fs::remove_file(target);
            return Err(e);
        }
        Ok(())
    }

    fn encode(&self, source: &Path, output: File) -> io::Result<()> {
        use bzip2::write::BzEncoder;
        use flate2::write::GzEncoder;
        use xz2::write::XzEncoder;

        match self {
            CompressionTag::Gz => {
                let mut encoder = GzEncoder::new(output, flate2::Compression::default());
                copy_from(source, &mut encoder)?;
                encoder.finish()?.flush()
            }
            CompressionTag::Bz2 => {
                let mut encoder = BzEncoder::new(output, bzip2::Compression::default());
                copy_from(source, &mut encoder)?;
                encoder.finish()?.flush()
            }
            CompressionTag::Xz => {
                let mut encoder = XzEncoder::new(output, XZ_PRESET);
                copy_from(source, &mut encoder)?;
                encoder.finish()?.flush()
            }
            CompressionTag::Lzma => {
                let mut encoder = XzEncoder::new_stream(output, lzma_stream()?);
                copy_from(source, &mut encoder)?;
                encoder.finish()?.flush()
            }
            CompressionTag::Zip => {
                let options = zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated);
                let mut writer = zip::ZipWriter::new(output);
                writer
                    .start_file(entry_name(source), options)
                    .map_err(zip_error)?;
                copy_from(source, &mut writer)?;
                writer.finish().map_err(zip_error)?.flush()
            }
            CompressionTag::Tar => archive(source, output)?.flush(),
            CompressionTag::TarGz => {
                let encoder = GzEncoder::new(output, flate2::Compression::default());
                archive(source, encoder)?.finish()?.flush()
            }
            CompressionTag::TarBz2 => {
                let encoder = BzEncoder::new(output, bzip2::Compression::default());
                archive(source, encoder)?.finish()?.flush()
            }
            CompressionTag::TarXz => {
                let encoder = XzEncoder::new(output, XZ_PRESET);
                archive(source, encoder)?.finish()?.flush()
            }
        }
    }
}

const XZ_PRESET: u32 = 6;

fn lzma_stream() -> io::Result<xz2::stream::Stream> {
    let options = xz2::stream::LzmaOptions::new_preset(XZ_PRESET)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    xz2::stream::Stream::new_lzma_encoder(&options)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

fn zip_error(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn entry_name(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string())
}

fn copy_from<W: Write>(source: &Path, writer: &mut W) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(source)?);
    io::copy(&mut reader, writer)
}

/// Write a single-entry tar archive and hand back the inner writer
fn archive<W: Write>(source: &Path, writer: W) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.append_path_with_name(source, entry_name(source))?;
    builder.into_inner()
}

impl fmt::Display for CompressionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for CompressionTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(stripped) = s.strip_prefix('.') {
            return Err(Error::config(format!(
                "Invalid compression extension '{}': it must not start with a dot (did you mean '{}'?)",
                s, stripped
            )));
        }

        if let Some(tag) = CompressionTag::ALL
            .iter()
            .find(|tag| tag.extension() == s)
        {
            return Ok(*tag);
        }

        if s.contains('.') {
            return Err(Error::config(format!(
                "Invalid compression extension '{}': combined extensions are only supported for tar archives (tar.gz, tar.bz2, tar.xz)",
                s
            )));
        }

        Err(Error::config(format!(
            "Invalid compression extension '{}': expected one of {}",
            s,
            CompressionTag::ALL
                .iter()
                .map(|tag| tag.extension())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}

/// Compression as given by the user, before validation
#[derive(Clone)]
pub enum CompressionOption {
    /// An extension tag such as `"gz"` or `"tar.xz"`
    Tag(String),
    /// A raw configuration value, which must turn out to be a tag string
    Value(toml::Value),
    /// A function that post-processes the finalized file in place
    Custom(CustomTransformFn),
}

impl CompressionOption {
    /// Wrap a custom post-processing function
    ///
    /// The function receives the finalized file path; renaming or removing
    /// that file is up to the function.
    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(&Path) -> io::Result<()> + Send + Sync + 'static,
    {
        CompressionOption::Custom(Arc::new(func))
    }
}

impl fmt::Debug for CompressionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionOption::Tag(tag) => f.debug_tuple("Tag").field(tag).finish(),
            CompressionOption::Value(value) => f.debug_tuple("Value").field(value).finish(),
            CompressionOption::Custom(_) => f.write_str("Custom(<function>)"),
        }
    }
}

impl From<&str> for CompressionOption {
    fn from(tag: &str) -> Self {
        CompressionOption::Tag(tag.to_string())
    }
}

impl From<String> for CompressionOption {
    fn from(tag: String) -> Self {
        CompressionOption::Tag(tag)
    }
}

impl From<CompressionTag> for CompressionOption {
    fn from(tag: CompressionTag) -> Self {
        CompressionOption::Tag(tag.extension().to_string())
    }
}

impl From<toml::Value> for CompressionOption {
    fn from(value: toml::Value) -> Self {
        CompressionOption::Value(value)
    }
}

/// A validated compression step, uniform across built-in and custom forms
#[derive(Clone)]
pub struct Transform {
    label: String,
    suffix: Option<&'static str>,
    func: TransformFn,
}

impl Transform {
    fn builtin(tag: CompressionTag) -> Self {
        Self {
            label: tag.extension().to_string(),
            suffix: Some(tag.extension()),
            func: Arc::new(move |source: &Path| tag.compress(source).map(Some)),
        }
    }

    fn custom(func: CustomTransformFn) -> Self {
        Self {
            label: "custom function".to_string(),
            suffix: None,
            func: Arc::new(move |source: &Path| func(source).map(|()| None)),
        }
    }

    /// Human-readable name used in logs and errors
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Extension appended by built-in formats
    pub fn suffix(&self) -> Option<&'static str> {
        self.suffix
    }

    /// Apply the transform, returning the artifact path when it is known
    pub fn apply(&self, source: &Path) -> io::Result<Option<PathBuf>> {
        (self.func)(source)
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("label", &self.label)
            .field("suffix", &self.suffix)
            .finish()
    }
}

/// Validate a compression specifier and turn it into a [`Transform`]
pub fn resolve(option: &CompressionOption) -> Result<Transform> {
    match option {
        CompressionOption::Tag(tag) => tag.parse().map(Transform::builtin),
        CompressionOption::Value(toml::Value::String(tag)) => tag.parse().map(Transform::builtin),
        CompressionOption::Value(other) => Err(Error::config(format!(
            "Invalid compression '{}': expected an extension string or a function, got {}",
            other,
            other.type_str()
        ))),
        CompressionOption::Custom(func) => Ok(Transform::custom(Arc::clone(func))),
    }
}

/// A finalized file waiting for its single compression pass
#[derive(Debug, Clone)]
pub struct CompressionJob {
    source: PathBuf,
    transform: Transform,
}

impl CompressionJob {
    pub fn new(source: PathBuf, transform: Transform) -> Self {
        Self { source, transform }
    }

    /// The finalized file this job consumes
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Extension the artifact will carry, if the transform is built in
    pub fn target_suffix(&self) -> Option<&'static str> {
        self.transform.suffix()
    }

    /// Run the transform on the finalized file
    pub fn run(self) -> std::result::Result<Option<PathBuf>, CompressionJobError> {
        self.transform
            .apply(&self.source)
            .map_err(|cause| CompressionJobError {
                source_path: self.source.clone(),
                transform: self.transform.label().to_string(),
                cause,
            })
    }
}

/// A compression job failed; the rotation it belongs to stands
#[derive(thiserror::Error, Debug)]
#[error("Compression of '{}' with {transform} failed: {cause}", .source_path.display())]
pub struct CompressionJobError {
    pub source_path: PathBuf,
    pub transform: String,
    #[source]
    pub cause: io::Error,
}
