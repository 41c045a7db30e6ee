use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const TRIAL_TYPE: &str = "survey-text";

pub type Metadata = serde_json::Map<String, Value>;
pub type Answers = BTreeMap<String, Answer>;

// Shared by every trial of a batch; must not carry trial-specific state.
pub type CheckHook = Arc<dyn Fn(&dyn Surface, &Answers) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextMode {
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceMode {
    Radio,
    Checkbox,
    Dropdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionKind {
    Text { mode: TextMode },
    MultipleChoice { mode: ChoiceMode, options: Vec<String> },
}

impl QuestionKind {
    pub fn is_single_choice(&self) -> bool {
        matches!(
            self,
            QuestionKind::MultipleChoice {
                mode: ChoiceMode::Radio | ChoiceMode::Dropdown,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSpec {
    text: String,
    kind: QuestionKind,
}

impl QuestionSpec {
    pub fn text_single(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: QuestionKind::Text {
                mode: TextMode::Single,
            },
        }
    }

    pub fn text_multi(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: QuestionKind::Text {
                mode: TextMode::Multi,
            },
        }
    }

    pub fn radio(
        text: impl Into<String>,
        options: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::multiple_choice(text, ChoiceMode::Radio, options)
    }

    pub fn checkbox(
        text: impl Into<String>,
        options: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::multiple_choice(text, ChoiceMode::Checkbox, options)
    }

    pub fn dropdown(
        text: impl Into<String>,
        options: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::multiple_choice(text, ChoiceMode::Dropdown, options)
    }

    pub fn multiple_choice(
        text: impl Into<String>,
        mode: ChoiceMode,
        options: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            text: text.into(),
            kind: QuestionKind::MultipleChoice {
                mode,
                options: options.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> &QuestionKind {
        &self.kind
    }
}

// Thunks resolve at render time, not factory time, so question text or
// choice sets can depend on an earlier trial's outcome.
pub enum Deferred<T> {
    Value(T),
    Thunk(Arc<dyn Fn() -> T>),
}

impl<T: Clone> Deferred<T> {
    pub fn thunk(f: impl Fn() -> T + 'static) -> Self {
        Deferred::Thunk(Arc::new(f))
    }

    pub fn resolve(&self) -> T {
        match self {
            Deferred::Value(v) => v.clone(),
            Deferred::Thunk(f) => f(),
        }
    }
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        match self {
            Deferred::Value(v) => Deferred::Value(v.clone()),
            Deferred::Thunk(f) => Deferred::Thunk(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Deferred::Thunk(_) => f.write_str("Thunk(..)"),
        }
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Deferred::Value(value)
    }
}

#[derive(Clone)]
pub enum Param<T> {
    Shared(T),
    PerTrial(Vec<T>),
}

#[derive(Clone)]
pub struct TrialSpec {
    pub instructions: Option<Deferred<String>>,
    pub numbered: Deferred<bool>,
    pub questions: Deferred<Vec<QuestionSpec>>,
    pub check: Option<CheckHook>,
    pub metadata: Deferred<Metadata>,
}

impl fmt::Debug for TrialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialSpec")
            .field("instructions", &self.instructions)
            .field("numbered", &self.numbered)
            .field("questions", &self.questions)
            .field("check", &self.check.as_ref().map(|_| "CheckHook(..)"))
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct BatchSpec {
    pub instructions: Vec<Option<Deferred<String>>>,
    pub numbered: Vec<Deferred<bool>>,
    pub questions: Vec<Deferred<Vec<QuestionSpec>>>,
    pub metadata: Option<Param<Deferred<Metadata>>>,
    pub check: Option<CheckHook>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchProblem {
    LengthMismatch {
        field: &'static str,
        expected: usize,
        found: usize,
    },
    EmptyQuestions {
        trial: usize,
    },
    EmptyChoices {
        trial: usize,
        question: usize,
    },
}

impl fmt::Display for BatchProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchProblem::LengthMismatch {
                field,
                expected,
                found,
            } => write!(f, "{} has {} entries, expected {}", field, found, expected),
            BatchProblem::EmptyQuestions { trial } => {
                write!(f, "trial {} has no questions", trial)
            }
            BatchProblem::EmptyChoices { trial, question } => {
                write!(f, "trial {} question {} has no choices", trial, question)
            }
        }
    }
}

fn join_problems(problems: &[BatchProblem]) -> String {
    problems
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("malformed_batch: {}", join_problems(.0))]
    Malformed(Vec<BatchProblem>),
}

impl BatchError {
    pub fn problems(&self) -> &[BatchProblem] {
        match self {
            BatchError::Malformed(problems) => problems,
        }
    }
}

// A malformed batch reports every problem in one error and never yields
// partial trials. Deferred fields pass through unresolved, so only
// literal question sets are validated here.
pub fn expand_batch(batch: &BatchSpec) -> Result<Vec<TrialSpec>, BatchError> {
    let expected = batch.questions.len();
    let mut problems = Vec::new();

    if batch.instructions.len() != expected {
        problems.push(BatchProblem::LengthMismatch {
            field: "instructions",
            expected,
            found: batch.instructions.len(),
        });
    }
    if batch.numbered.len() != expected {
        problems.push(BatchProblem::LengthMismatch {
            field: "numbered",
            expected,
            found: batch.numbered.len(),
        });
    }
    if let Some(Param::PerTrial(per_trial)) = &batch.metadata {
        if per_trial.len() != expected {
            problems.push(BatchProblem::LengthMismatch {
                field: "metadata",
                expected,
                found: per_trial.len(),
            });
        }
    }

    for (trial, questions) in batch.questions.iter().enumerate() {
        if let Deferred::Value(questions) = questions {
            if questions.is_empty() {
                problems.push(BatchProblem::EmptyQuestions { trial });
            }
            for (question, spec) in questions.iter().enumerate() {
                if let QuestionKind::MultipleChoice { options, .. } = spec.kind() {
                    if options.is_empty() {
                        problems.push(BatchProblem::EmptyChoices { trial, question });
                    }
                }
            }
        }
    }

    if !problems.is_empty() {
        return Err(BatchError::Malformed(problems));
    }

    let mut trials = Vec::with_capacity(expected);
    for i in 0..expected {
        let metadata = match &batch.metadata {
            None => Deferred::Value(Metadata::new()),
            Some(Param::Shared(shared)) => shared.clone(),
            Some(Param::PerTrial(per_trial)) => per_trial[i].clone(),
        };
        trials.push(TrialSpec {
            instructions: batch.instructions[i].clone(),
            numbered: batch.numbered[i].clone(),
            questions: batch.questions[i].clone(),
            check: batch.check.clone(),
            metadata,
        });
    }
    Ok(trials)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Answer {
    Text(String),
    Choice(String),
    Checked(Vec<String>),
    // a single-choice question left unanswered; recorded absence, not an error
    None,
}

impl Answer {
    pub fn to_value(&self) -> Value {
        match self {
            Answer::Text(s) | Answer::Choice(s) => Value::String(s.clone()),
            Answer::Checked(labels) => {
                Value::Array(labels.iter().cloned().map(Value::String).collect())
            }
            Answer::None => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseRecord {
    pub trial_type: String,
    pub response_time_ms: u64,
    pub completed_at: String,
    pub answers: Answers,
    pub metadata: Metadata,
}

impl ResponseRecord {
    // Metadata wins on key collisions, matching the record's merge order.
    pub fn to_flat_json(&self) -> Value {
        let mut row = Metadata::new();
        row.insert("trial_type".to_string(), Value::String(self.trial_type.clone()));
        row.insert("rt".to_string(), Value::from(self.response_time_ms));
        row.insert(
            "completed_at".to_string(),
            Value::String(self.completed_at.clone()),
        );
        for (key, answer) in &self.answers {
            row.insert(key.clone(), answer.to_value());
        }
        for (key, value) in &self.metadata {
            row.insert(key.clone(), value.clone());
        }
        Value::Object(row)
    }
}

// Attached at render time; the question ordinal carried here is the only
// key used at extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionTag {
    Instructions,
    Question(usize),
    Submit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Widget {
    Label(String),
    TextField {
        value: String,
    },
    TextArea {
        value: String,
    },
    RadioGroup {
        options: Vec<String>,
        selected: Option<usize>,
    },
    CheckboxGroup {
        options: Vec<String>,
        checked: Vec<bool>,
    },
    // The placeholder is the reserved "no answer" entry; it sits outside
    // `options` and is never read back as an answer.
    Dropdown {
        placeholder: String,
        options: Vec<String>,
        selected: Option<usize>,
    },
    SubmitButton {
        label: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub tag: RegionTag,
    pub widgets: Vec<Widget>,
}

// Each trial owns its own surface scope; nothing is globally addressable.
pub trait Surface {
    fn clear(&mut self);
    fn append(&mut self, region: Region);
    fn region(&self, tag: RegionTag) -> Option<&Region>;
    fn region_mut(&mut self, tag: RegionTag) -> Option<&mut Region>;
}
