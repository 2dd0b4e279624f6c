//! Stylesheet compilation and per-instance scoping.

use crate::identity::InstanceId;

/// Failure reported by a stylesheet compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleDiagnostic {
    pub message: String,
    /// 1-based line of the offending input.
    pub line: usize,
    /// 0-based column of the offending input.
    pub column: usize,
    /// Source lines starting at `line`.
    pub excerpt: Vec<String>,
}

impl StyleDiagnostic {
    /// Zero-based line/column display with a caret under the offending column.
    ///
    /// ```text
    /// Unclosed block: missing '}' (0:0)
    ///
    /// > 0 |h1{color:
    ///      ^
    /// ```
    pub fn display(&self) -> String {
        let first = self.line.saturating_sub(1);
        let last = first + self.excerpt.len().saturating_sub(1);
        let width = last.to_string().len();

        let mut rows = Vec::with_capacity(self.excerpt.len() + 1);
        for (index, text) in self.excerpt.iter().enumerate() {
            let marker = if index == 0 { "> " } else { "  " };
            let gutter = format!("{}{:>width$} |", marker, first + index, width = width);
            rows.push(format!("{}{}", gutter, text));
            if index == 0 {
                rows.push(format!("{}^", " ".repeat(gutter.len() + self.column)));
            }
        }

        format!("{} ({}:{})\n\n{}", self.message, first, self.column, rows.join("\n"))
    }
}

/// The stylesheet-language compiler.
pub trait StyleCompiler {
    fn compile(&self, source: &str) -> Result<String, StyleDiagnostic>;
}

/// Compiled CSS whose rules all sit under one instance's selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedStyle {
    instance: InstanceId,
    css: String,
}

impl ScopedStyle {
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn css(&self) -> &str {
        &self.css
    }
}

pub struct StyleScoper {
    compiler: Box<dyn StyleCompiler>,
}

impl StyleScoper {
    pub fn new(compiler: impl StyleCompiler + 'static) -> Self {
        Self {
            compiler: Box::new(compiler),
        }
    }

    /// Compile a user stylesheet.
    pub fn compile(&self, source: &str) -> Result<String, StyleDiagnostic> {
        self.compiler.compile(source)
    }

    /// Nest compiled CSS under `instance`'s selector.
    pub fn scope(&self, instance: &InstanceId, raw_css: &str) -> Result<ScopedStyle, StyleDiagnostic> {
        let wrapped = format!("{} {{\n{}\n}}", instance.selector(), raw_css);
        let css = self.compiler.compile(&wrapped)?;
        Ok(ScopedStyle {
            instance: instance.clone(),
            css,
        })
    }
}
