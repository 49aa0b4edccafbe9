use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;

use clozesync_core::Picture;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::debug;

pub const IMAGE_EXTENSIONS: [&str; 13] = [
    "jpg", "jpeg", "jxl", "png", "gif", "bmp", "svg", "webp", "apng", "ico", "tif", "tiff", "avif",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderRequest<'a> {
    InlineMath(&'a str),
    DisplayMath(&'a str),
    /// `path` is resolved and exists; `name` is the link text from the note.
    Image { path: &'a Path, name: &'a str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    Text(String),
    Picture(Picture),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to talk to {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with {status}")]
    Failed { tool: String, status: ExitStatus },
    #[error("{tool} produced non UTF-8 output")]
    NotUtf8 { tool: String },
    #[error("converted image {0} is missing")]
    MissingOutput(PathBuf),
}

/// Turns math and image references into card content. Implementations may
/// block; callers run them off the async runtime.
pub trait RenderService: Send + Sync {
    fn render(&self, request: &RenderRequest<'_>) -> Result<Rendered, RenderError>;
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Rendered math must never contain `}}`, which would close the cloze.
pub fn escape_cloze_braces(text: &str) -> String {
    text.replace('}', "} ")
}

fn latex_delimited(source: &str, display: bool) -> String {
    if display {
        format!("\\[{source}\\]")
    } else {
        format!("\\({source}\\)")
    }
}

/// Uses `typst`, `pandoc` and `djxl` from `PATH`.
#[derive(Debug, Clone)]
pub struct ProcessRenderer {
    typst: String,
    pandoc: String,
    djxl: String,
    scratch: PathBuf,
}

impl Default for ProcessRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRenderer {
    pub fn new() -> Self {
        Self::with_tools("typst", "pandoc", "djxl")
    }

    pub fn with_tools(
        typst: impl Into<String>,
        pandoc: impl Into<String>,
        djxl: impl Into<String>,
    ) -> Self {
        Self {
            typst: typst.into(),
            pandoc: pandoc.into(),
            djxl: djxl.into(),
            scratch: std::env::temp_dir().join("clozesync"),
        }
    }

    fn math(&self, source: &str, display: bool) -> Result<String, RenderError> {
        let typst_source = if display {
            format!("$ {source} $")
        } else {
            format!("${source}$")
        };
        let rendered = if self.is_typst(&typst_source)? {
            self.typst_to_latex(&typst_source)?
        } else {
            latex_delimited(source, display)
        };
        Ok(escape_cloze_braces(&rendered))
    }

    fn is_typst(&self, source: &str) -> Result<bool, RenderError> {
        let mut child = Command::new(&self.typst)
            .args(["c", "-", "-f", "pdf", "/dev/null"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| RenderError::Spawn {
                tool: self.typst.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .map_err(|source| RenderError::Io {
                    tool: self.typst.clone(),
                    source,
                })?;
        }
        let status = child.wait().map_err(|source| RenderError::Io {
            tool: self.typst.clone(),
            source,
        })?;
        Ok(status.success())
    }

    fn typst_to_latex(&self, source: &str) -> Result<String, RenderError> {
        let mut child = Command::new(&self.pandoc)
            .args(["-f", "typst", "-t", "latex"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| RenderError::Spawn {
                tool: self.pandoc.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(source.as_bytes())
                .map_err(|source| RenderError::Io {
                    tool: self.pandoc.clone(),
                    source,
                })?;
        }
        let output = child.wait_with_output().map_err(|source| RenderError::Io {
            tool: self.pandoc.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(RenderError::Failed {
                tool: self.pandoc.clone(),
                status: output.status,
            });
        }
        let text = String::from_utf8(output.stdout).map_err(|_| RenderError::NotUtf8 {
            tool: self.pandoc.clone(),
        })?;
        Ok(text.trim_end_matches('\n').to_string())
    }

    fn image(&self, path: &Path, name: &str) -> Result<Picture, RenderError> {
        let is_jxl = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jxl"));
        if !is_jxl {
            return Ok(Picture::on_back(path.to_path_buf(), name));
        }
        let mut converted = self.scratch.join(name);
        converted.set_extension("jpg");
        if let Some(parent) = converted.parent() {
            std::fs::create_dir_all(parent).map_err(|source| RenderError::Io {
                tool: self.djxl.clone(),
                source,
            })?;
        }
        let status = Command::new(&self.djxl)
            .arg(path)
            .arg(&converted)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| RenderError::Spawn {
                tool: self.djxl.clone(),
                source,
            })?;
        if !status.success() {
            return Err(RenderError::Failed {
                tool: self.djxl.clone(),
                status,
            });
        }
        if !converted.exists() {
            return Err(RenderError::MissingOutput(converted));
        }
        let mut filename = PathBuf::from(name);
        filename.set_extension("jpg");
        debug!(source = %path.display(), target = %converted.display(), "converted jxl image");
        Ok(Picture::on_back(
            converted,
            filename.to_string_lossy().into_owned(),
        ))
    }
}

impl RenderService for ProcessRenderer {
    fn render(&self, request: &RenderRequest<'_>) -> Result<Rendered, RenderError> {
        match *request {
            RenderRequest::InlineMath(source) => self.math(source, false).map(Rendered::Text),
            RenderRequest::DisplayMath(source) => self.math(source, true).map(Rendered::Text),
            RenderRequest::Image { path, name } => self.image(path, name).map(Rendered::Picture),
        }
    }
}

/// Deterministic renderer that never spawns processes: math is wrapped in
/// LaTeX delimiters and images are attached as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughRenderer;

impl RenderService for PassthroughRenderer {
    fn render(&self, request: &RenderRequest<'_>) -> Result<Rendered, RenderError> {
        Ok(match *request {
            RenderRequest::InlineMath(source) => {
                Rendered::Text(escape_cloze_braces(&latex_delimited(source, false)))
            }
            RenderRequest::DisplayMath(source) => {
                Rendered::Text(escape_cloze_braces(&latex_delimited(source, true)))
            }
            RenderRequest::Image { path, name } => {
                Rendered::Picture(Picture::on_back(path.to_path_buf(), name))
            }
        })
    }
}

/// Caps how many render calls run at once across all file workers, leaving
/// the rest of extraction unthrottled. Call it from blocking threads only.
pub struct LimitedRenderer {
    inner: Arc<dyn RenderService>,
    permits: Semaphore,
    runtime: Handle,
}

impl LimitedRenderer {
    pub fn new(inner: Arc<dyn RenderService>, limit: usize, runtime: Handle) -> Self {
        Self {
            inner,
            permits: Semaphore::new(limit.max(1)),
            runtime,
        }
    }
}

impl RenderService for LimitedRenderer {
    fn render(&self, request: &RenderRequest<'_>) -> Result<Rendered, RenderError> {
        let _permit = self.runtime.block_on(self.permits.acquire()).ok();
        self.inner.render(request)
    }
}
