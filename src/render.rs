//! Handoff to document renderers.
//!
//! The assembled HTML is the only thing this crate produces; PDF, EPUB and
//! DOCX come from external tools. [`CommandRenderer`] runs the argv template
//! configured for a format under `[render.commands]`:
//!
//! ```toml
//! [render.commands]
//! pdf = ["weasyprint", "{input}", "{output}"]
//! epub = ["pandoc", "{input}", "-o", "{output}"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::config::RenderConfig;
use crate::types::OutputFormat;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("no renderer configured for {0}")]
    NotConfigured(OutputFormat),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("renderer reported success but wrote no {0}")]
    NoOutput(PathBuf),
}

pub trait Renderer: Send + Sync {
    /// Render `input` to `output` in `format`.
    fn render(&self, input: &Path, format: OutputFormat, output: &Path) -> Result<(), RenderError>;
}

#[derive(Debug, Clone, Default)]
pub struct CommandRenderer {
    commands: BTreeMap<String, Vec<String>>,
}

impl CommandRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            commands: config.commands.clone(),
        }
    }

    fn argv(&self, format: OutputFormat, input: &Path, output: &Path) -> Option<Vec<String>> {
        let template = self.commands.get(format.extension())?;
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let argv: Vec<String> = template
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect();
        (!argv.is_empty()).then_some(argv)
    }
}

impl Renderer for CommandRenderer {
    fn render(&self, input: &Path, format: OutputFormat, output: &Path) -> Result<(), RenderError> {
        let argv = self
            .argv(format, input, output)
            .ok_or(RenderError::NotConfigured(format))?;
        let (program, args) = argv.split_first().ok_or(RenderError::NotConfigured(format))?;
        tracing::info!(format = %format, program = %program, "rendering");
        let result = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| RenderError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !result.status.success() {
            return Err(RenderError::Failed {
                program: program.clone(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !output.exists() {
            return Err(RenderError::NoOutput(output.to_path_buf()));
        }
        Ok(())
    }
}
