pub mod engine;

pub use engine::{EnginePhase, RunOutcome, RunReport, ScriptContext, ScriptEngine, ScriptEnv};

/// One executable line of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based line in the script body.
    pub line: usize,
    pub text: String,
}

/// A named, immutable sequence of statements received from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    name: String,
    body: String,
    statements: Vec<Statement>,
}

impl Script {
    /// Splits `body` into statements. Blank lines are skipped but still count
    /// towards line numbers, so reported lines match the controller's editor.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        let statements = body
            .lines()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let text = raw.trim();
                (!text.is_empty()).then(|| Statement {
                    line: idx + 1,
                    text: text.to_string(),
                })
            })
            .collect();
        Self {
            name: name.into(),
            body,
            statements,
        }
    }

    pub fn from_statements<I, S>(name: impl Into<String>, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let body = statements
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        Self::new(name, body)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
