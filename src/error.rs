//! Error taxonomy for the preview pipeline.
//!
//! Every kind is recoverable: the host converts each one into a presented
//! state in the slot named by [`PreviewError::slot`].

use crate::style::StyleDiagnostic;
use thiserror::Error;

/// Where an error is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSlot {
    /// Inline next to the component source editor.
    Editor,
    /// Inline next to the stylesheet editor.
    Stylesheet,
    /// In place of the rendered artifact.
    Artifact,
    /// Next to the dependency declaration that failed.
    Declaration,
    /// Host-level log only.
    Runtime,
}

#[derive(Debug, Error)]
pub enum PreviewError {
    /// The upstream compiler rejected the component source.
    #[error("{0}")]
    Transpile(String),

    /// The stylesheet compiler rejected the stylesheet source.
    #[error("{}", .0.display())]
    StyleCompile(StyleDiagnostic),

    /// Compiled text threw while being turned into a module.
    #[error("{message}")]
    Materialization { message: String },

    #[error("remote component has no default export")]
    MissingDefaultExport,

    /// The mounted implementation threw while producing its output.
    #[error("{message}")]
    Render { component: String, message: String },

    #[error("failed to load dependency '{import_name}' from {url}: {reason}")]
    DependencyLoad {
        import_name: String,
        url: String,
        reason: String,
    },

    #[error("compiler runtime failed to load: {0}")]
    RuntimeBootstrap(String),

    #[error("invalid props: {0}")]
    InvalidProps(String),

    #[error("no mounted instance {0}")]
    UnknownInstance(String),

    /// Isolate or host infrastructure failure.
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

impl PreviewError {
    pub fn slot(&self) -> ErrorSlot {
        match self {
            Self::Transpile(_) => ErrorSlot::Editor,
            Self::StyleCompile(_) => ErrorSlot::Stylesheet,
            Self::Materialization { .. }
            | Self::MissingDefaultExport
            | Self::Render { .. }
            | Self::InvalidProps(_) => ErrorSlot::Artifact,
            Self::DependencyLoad { .. } => ErrorSlot::Declaration,
            Self::RuntimeBootstrap(_) | Self::UnknownInstance(_) | Self::Engine(_) => ErrorSlot::Runtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots() {
        assert_eq!(PreviewError::Transpile("x".into()).slot(), ErrorSlot::Editor);
        assert_eq!(PreviewError::MissingDefaultExport.slot(), ErrorSlot::Artifact);
        assert_eq!(
            PreviewError::Render { component: "A".into(), message: "x".into() }.slot(),
            ErrorSlot::Artifact
        );
        assert_eq!(PreviewError::RuntimeBootstrap("offline".into()).slot(), ErrorSlot::Runtime);
    }

    #[test]
    fn test_dependency_message_names_the_import() {
        let err = PreviewError::DependencyLoad {
            import_name: "dayjs".into(),
            url: "https://unpkg.com/dayjs".into(),
            reason: "404".into(),
        };
        let text = err.to_string();
        assert!(text.contains("dayjs"));
        assert!(text.contains("404"));
        assert_eq!(err.slot(), ErrorSlot::Declaration);
    }
}
