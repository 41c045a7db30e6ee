use chrono::Utc;
use std::time::Instant;
use survey_core::{
    Answer, Answers, ChoiceMode, Metadata, QuestionKind, QuestionSpec, Region, RegionTag,
    ResponseRecord, Surface, TextMode, TrialSpec, Widget, TRIAL_TYPE,
};
use thiserror::Error;
use tracing::{debug, warn};

pub trait Clock {
    fn now_ms(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

// Policy for a radio or dropdown left without a selection at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnansweredChoice {
    #[default]
    RecordAbsent,
    BlockSubmission,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub submit_label: String,
    pub dropdown_placeholder: String,
    pub unanswered_choice: UnansweredChoice,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            submit_label: "Submit".to_string(),
            dropdown_placeholder: "Choose your answer".to_string(),
            unanswered_choice: UnansweredChoice::RecordAbsent,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrialError {
    #[error("empty_trial: trial resolved to zero questions")]
    EmptyQuestions,
    #[error("empty_choices: question {question} resolved to an empty choice list")]
    EmptyChoices { question: usize },
    #[error("already_rendered: render may only run once per trial")]
    AlreadyRendered,
    #[error("not_awaiting_submission: submit fired before rendering completed")]
    NotAwaitingSubmission,
    #[error("surface_out_of_sync: no usable input for question {question}")]
    SurfaceOutOfSync { question: usize },
    #[error("unknown_option: question {question} has no option {option}")]
    UnknownOption { question: usize, option: usize },
}

// Everything except `Completed` leaves the trial awaiting another
// submission; `AlreadyFinalized` is an ignored duplicate fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Completed,
    Rejected,
    MissingAnswer { question: usize },
    AlreadyFinalized,
}

pub type OnComplete = Box<dyn FnOnce(ResponseRecord)>;

enum Phase {
    Rendering,
    AwaitingSubmission { start_ms: u64 },
    Finalized,
}

struct ResolvedTrial {
    instructions: Option<String>,
    numbered: bool,
    questions: Vec<QuestionSpec>,
    metadata: Metadata,
}

// The session holds the one pending completion callback per trial; it is
// consumed on the first successful finalization, so a duplicate trigger
// can never fire it twice.
pub struct TrialSession {
    trial: TrialSpec,
    options: RenderOptions,
    clock: Box<dyn Clock>,
    phase: Phase,
    resolved: Option<ResolvedTrial>,
    on_complete: Option<OnComplete>,
}

impl TrialSession {
    pub fn new(
        trial: TrialSpec,
        options: RenderOptions,
        on_complete: impl FnOnce(ResponseRecord) + 'static,
    ) -> Self {
        Self::with_clock(trial, options, Box::new(MonotonicClock::new()), on_complete)
    }

    pub fn with_clock(
        trial: TrialSpec,
        options: RenderOptions,
        clock: Box<dyn Clock>,
        on_complete: impl FnOnce(ResponseRecord) + 'static,
    ) -> Self {
        Self {
            trial,
            options,
            clock,
            phase: Phase::Rendering,
            resolved: None,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn is_awaiting_submission(&self) -> bool {
        matches!(self.phase, Phase::AwaitingSubmission { .. })
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.phase, Phase::Finalized)
    }

    pub fn render(&mut self, surface: &mut dyn Surface) -> Result<(), TrialError> {
        if !matches!(self.phase, Phase::Rendering) {
            return Err(TrialError::AlreadyRendered);
        }
        let resolved = resolve_trial(&self.trial)?;

        surface.clear();
        if let Some(instructions) = &resolved.instructions {
            surface.append(Region {
                tag: RegionTag::Instructions,
                widgets: vec![Widget::Label(instructions.clone())],
            });
        }
        for (ordinal, question) in resolved.questions.iter().enumerate() {
            let numbering = if resolved.numbered {
                format!("{}. ", ordinal + 1)
            } else {
                String::new()
            };
            surface.append(Region {
                tag: RegionTag::Question(ordinal),
                widgets: vec![
                    Widget::Label(format!("{}{}", numbering, question.text())),
                    input_widget(question, &self.options),
                ],
            });
        }
        surface.append(Region {
            tag: RegionTag::Submit,
            widgets: vec![Widget::SubmitButton {
                label: self.options.submit_label.clone(),
            }],
        });

        debug!(
            questions = resolved.questions.len(),
            "trial rendered; awaiting submission"
        );
        self.resolved = Some(resolved);
        self.phase = Phase::AwaitingSubmission {
            start_ms: self.clock.now_ms(),
        };
        Ok(())
    }

    pub fn submit(&mut self, surface: &mut dyn Surface) -> Result<SubmitOutcome, TrialError> {
        let start_ms = match self.phase {
            Phase::AwaitingSubmission { start_ms } => start_ms,
            Phase::Finalized => {
                debug!("duplicate submit after finalization ignored");
                return Ok(SubmitOutcome::AlreadyFinalized);
            }
            Phase::Rendering => return Err(TrialError::NotAwaitingSubmission),
        };
        let Some(resolved) = &self.resolved else {
            return Err(TrialError::NotAwaitingSubmission);
        };

        let now = self.clock.now_ms();
        let response_time_ms = if now < start_ms {
            warn!(start_ms, now, "clock ran backwards within a trial; clamping response time to 0");
            0
        } else {
            now - start_ms
        };

        let mut answers = Answers::new();
        for (ordinal, question) in resolved.questions.iter().enumerate() {
            let region = surface
                .region(RegionTag::Question(ordinal))
                .ok_or(TrialError::SurfaceOutOfSync { question: ordinal })?;
            let answer = extract_answer(question, region)
                .ok_or(TrialError::SurfaceOutOfSync { question: ordinal })?;
            if answer == Answer::None
                && question.kind().is_single_choice()
                && self.options.unanswered_choice == UnansweredChoice::BlockSubmission
            {
                return Ok(SubmitOutcome::MissingAnswer { question: ordinal });
            }
            answers.insert(format!("Q{}", ordinal), answer);
        }

        if let Some(check) = &self.trial.check {
            if !check(&*surface, &answers) {
                debug!("submission rejected by check hook; awaiting resubmission");
                return Ok(SubmitOutcome::Rejected);
            }
        }

        let record = ResponseRecord {
            trial_type: TRIAL_TYPE.to_string(),
            response_time_ms,
            completed_at: Utc::now().to_rfc3339(),
            answers,
            metadata: resolved.metadata.clone(),
        };
        surface.clear();
        self.phase = Phase::Finalized;
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(record);
        }
        Ok(SubmitOutcome::Completed)
    }
}

fn resolve_trial(trial: &TrialSpec) -> Result<ResolvedTrial, TrialError> {
    let questions = trial.questions.resolve();
    if questions.is_empty() {
        return Err(TrialError::EmptyQuestions);
    }
    for (ordinal, question) in questions.iter().enumerate() {
        if let QuestionKind::MultipleChoice { options, .. } = question.kind() {
            if options.is_empty() {
                return Err(TrialError::EmptyChoices { question: ordinal });
            }
        }
    }
    Ok(ResolvedTrial {
        instructions: trial.instructions.as_ref().map(|d| d.resolve()),
        numbered: trial.numbered.resolve(),
        questions,
        metadata: trial.metadata.resolve(),
    })
}

fn input_widget(question: &QuestionSpec, options: &RenderOptions) -> Widget {
    match question.kind() {
        QuestionKind::Text {
            mode: TextMode::Single,
        } => Widget::TextField {
            value: String::new(),
        },
        QuestionKind::Text {
            mode: TextMode::Multi,
        } => Widget::TextArea {
            value: String::new(),
        },
        QuestionKind::MultipleChoice {
            mode,
            options: choices,
        } => match mode {
            ChoiceMode::Radio => Widget::RadioGroup {
                options: choices.clone(),
                selected: None,
            },
            ChoiceMode::Checkbox => Widget::CheckboxGroup {
                checked: vec![false; choices.len()],
                options: choices.clone(),
            },
            ChoiceMode::Dropdown => Widget::Dropdown {
                placeholder: options.dropdown_placeholder.clone(),
                options: choices.clone(),
                selected: None,
            },
        },
    }
}

fn extract_answer(question: &QuestionSpec, region: &Region) -> Option<Answer> {
    match question.kind() {
        QuestionKind::Text {
            mode: TextMode::Single,
        } => region.widgets.iter().find_map(|widget| match widget {
            Widget::TextField { value } => Some(Answer::Text(value.clone())),
            _ => None,
        }),
        QuestionKind::Text {
            mode: TextMode::Multi,
        } => region.widgets.iter().find_map(|widget| match widget {
            Widget::TextArea { value } => Some(Answer::Text(value.clone())),
            _ => None,
        }),
        QuestionKind::MultipleChoice {
            mode: ChoiceMode::Radio,
            ..
        } => region.widgets.iter().find_map(|widget| match widget {
            Widget::RadioGroup { options, selected } => Some(label_or_absent(options, *selected)),
            _ => None,
        }),
        QuestionKind::MultipleChoice {
            mode: ChoiceMode::Checkbox,
            ..
        } => region.widgets.iter().find_map(|widget| match widget {
            Widget::CheckboxGroup { options, checked } => Some(Answer::Checked(
                options
                    .iter()
                    .zip(checked)
                    .filter(|(_, checked)| **checked)
                    .map(|(label, _)| label.clone())
                    .collect(),
            )),
            _ => None,
        }),
        QuestionKind::MultipleChoice {
            mode: ChoiceMode::Dropdown,
            ..
        } => region.widgets.iter().find_map(|widget| match widget {
            Widget::Dropdown {
                options, selected, ..
            } => Some(label_or_absent(options, *selected)),
            _ => None,
        }),
    }
}

fn label_or_absent(options: &[String], selected: Option<usize>) -> Answer {
    match selected.and_then(|index| options.get(index)) {
        Some(label) => Answer::Choice(label.clone()),
        None => Answer::None,
    }
}

// In-memory reference surface; the input helpers mutate widget state the
// way a respondent would. Hosts with their own widget tree implement
// `Surface` instead.
#[derive(Debug, Default)]
pub struct PanelSurface {
    regions: Vec<Region>,
}

impl PanelSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn enter_text(&mut self, question: usize, value: &str) -> Result<(), TrialError> {
        let region = self.question_mut(question)?;
        for widget in &mut region.widgets {
            match widget {
                Widget::TextField { value: current } | Widget::TextArea { value: current } => {
                    *current = value.to_string();
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(TrialError::SurfaceOutOfSync { question })
    }

    pub fn choose(&mut self, question: usize, option: usize) -> Result<(), TrialError> {
        let region = self.question_mut(question)?;
        for widget in &mut region.widgets {
            if let Widget::RadioGroup { options, selected } = widget {
                if option >= options.len() {
                    return Err(TrialError::UnknownOption { question, option });
                }
                *selected = Some(option);
                return Ok(());
            }
        }
        Err(TrialError::SurfaceOutOfSync { question })
    }

    pub fn toggle(&mut self, question: usize, option: usize) -> Result<(), TrialError> {
        let region = self.question_mut(question)?;
        for widget in &mut region.widgets {
            if let Widget::CheckboxGroup { checked, .. } = widget {
                match checked.get_mut(option) {
                    Some(state) => {
                        *state = !*state;
                        return Ok(());
                    }
                    None => return Err(TrialError::UnknownOption { question, option }),
                }
            }
        }
        Err(TrialError::SurfaceOutOfSync { question })
    }

    // `None` returns the dropdown to its placeholder.
    pub fn select(&mut self, question: usize, option: Option<usize>) -> Result<(), TrialError> {
        let region = self.question_mut(question)?;
        for widget in &mut region.widgets {
            if let Widget::Dropdown {
                options, selected, ..
            } = widget
            {
                if let Some(index) = option {
                    if index >= options.len() {
                        return Err(TrialError::UnknownOption {
                            question,
                            option: index,
                        });
                    }
                }
                *selected = option;
                return Ok(());
            }
        }
        Err(TrialError::SurfaceOutOfSync { question })
    }

    fn question_mut(&mut self, question: usize) -> Result<&mut Region, TrialError> {
        self.region_mut(RegionTag::Question(question))
            .ok_or(TrialError::SurfaceOutOfSync { question })
    }
}

impl Surface for PanelSurface {
    fn clear(&mut self) {
        self.regions.clear();
    }

    fn append(&mut self, region: Region) {
        self.regions.push(region);
    }

    fn region(&self, tag: RegionTag) -> Option<&Region> {
        self.regions.iter().find(|region| region.tag == tag)
    }

    fn region_mut(&mut self, tag: RegionTag) -> Option<&mut Region> {
        self.regions.iter_mut().find(|region| region.tag == tag)
    }
}
