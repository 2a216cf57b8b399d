use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::{Api, ApiError, Role};
use crate::clock::Clock;
use crate::sync::SharedStateChannel;
use crate::tools::ToolSlot;

pub const QUIZ_SESSION_KEY: &str = "quiz-session";

fn no_session() -> Option<QuizSessionState> {
    None
}

/// The live quiz session occupies one slot of the shared room blob; an
/// absent slot means no session is running.
pub const QUIZ_SESSION: ToolSlot<Option<QuizSessionState>> =
    ToolSlot::new(QUIZ_SESSION_KEY, no_session);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    Active,
    Reviewing,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizSessionState {
    pub quiz_id: String,
    pub status: QuizStatus,
    pub current_question_index: usize,
    pub question_started_at: Option<i64>,
    pub show_results: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Text,
    MultipleChoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub qtype: QuestionType,
    #[serde(default)]
    pub choices: Vec<String>,
    #[serde(default)]
    pub correct_answer: Option<String>,
    pub time_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub answer_id: String,
    pub question_id: String,
    pub user_id: String,
    pub user_name: String,
    pub answer_text: String,
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub scored_by: Option<String>,
    #[serde(default)]
    pub scored_at: Option<i64>,
}

/// Remaining countdown seconds, derived from the anchor instant on every
/// call. Storing the anchor rather than a ticking counter keeps every
/// client, including late joiners and reloads, in agreement.
pub fn remaining_secs(time_limit_secs: i64, started_at_ms: i64, now_ms: i64) -> i64 {
    (time_limit_secs - (now_ms - started_at_ms) / 1000).max(0)
}

pub fn correct_count<'a>(answers: impl IntoIterator<Item = &'a Answer>) -> usize {
    answers
        .into_iter()
        .filter(|a| a.is_correct == Some(true))
        .count()
}

#[derive(Debug)]
pub enum QuizError {
    Api(ApiError),
    NotTeacher,
    NoQuestions,
    /// The requested action is not legal from the current session status.
    InvalidTransition {
        action: &'static str,
        status: Option<QuizStatus>,
    },
    EmptyAnswer,
    TimeExpired,
    AlreadyAnswered,
    MalformedResponse(String),
}

impl From<ApiError> for QuizError {
    fn from(e: ApiError) -> Self {
        QuizError::Api(e)
    }
}

impl std::fmt::Display for QuizError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuizError::Api(e) => write!(f, "api error: {}", e),
            QuizError::NotTeacher => write!(f, "teacher role required"),
            QuizError::NoQuestions => write!(f, "quiz has no questions"),
            QuizError::InvalidTransition { action, status } => {
                write!(f, "cannot {} from {:?}", action, status)
            }
            QuizError::EmptyAnswer => write!(f, "answer must not be empty"),
            QuizError::TimeExpired => write!(f, "time is up for this question"),
            QuizError::AlreadyAnswered => write!(f, "already answered this question"),
            QuizError::MalformedResponse(m) => write!(f, "malformed response: {}", m),
        }
    }
}

/// Drives one live quiz session against the shared room channel.
///
/// The teacher instance originates every session transition (all of which
/// are flushed immediately rather than debounced; losing a transition to
/// coalescing would desynchronize the room). Student instances observe
/// the session slot through their channel and keep a per-question cache
/// of their own submissions, rebuilt whenever the teacher advances the
/// question index.
pub struct QuizSessionMachine<A: Api, C: Clock> {
    api: A,
    clock: C,
    loaded_quiz: Option<String>,
    questions: Vec<Question>,
    my_answers: HashMap<String, Answer>,
    all_answers: Vec<Answer>,
    observed_index: Option<usize>,
    observed_status: Option<QuizStatus>,
}

impl<A: Api, C: Clock> QuizSessionMachine<A, C> {
    pub fn new(api: A, clock: C) -> Self {
        Self {
            api,
            clock,
            loaded_quiz: None,
            questions: Vec::new(),
            my_answers: HashMap::new(),
            all_answers: Vec::new(),
            observed_index: None,
            observed_status: None,
        }
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn session(&self, channel: &SharedStateChannel<A, C>) -> Option<QuizSessionState> {
        QUIZ_SESSION.get(channel)
    }

    pub fn current_question(&self, channel: &SharedStateChannel<A, C>) -> Option<&Question> {
        let session = self.session(channel)?;
        if session.status != QuizStatus::Active {
            return None;
        }
        self.questions.get(session.current_question_index)
    }

    /// Seconds left on the current question, or None when no question is
    /// live.
    pub fn remaining_for_current(&self, channel: &SharedStateChannel<A, C>) -> Option<i64> {
        let session = self.session(channel)?;
        let started_at = session.question_started_at?;
        let question = self.questions.get(session.current_question_index)?;
        Some(remaining_secs(
            question.time_limit,
            started_at,
            self.clock.now_ms(),
        ))
    }

    // ---- teacher transitions ----

    fn ensure_teacher(&self, channel: &SharedStateChannel<A, C>) -> Result<(), QuizError> {
        if channel.actor().role != Role::Teacher {
            return Err(QuizError::NotTeacher);
        }
        Ok(())
    }

    fn write_session(
        &self,
        channel: &mut SharedStateChannel<A, C>,
        session: Option<QuizSessionState>,
    ) -> Result<(), QuizError> {
        let applied = match session {
            Some(s) => QUIZ_SESSION.set(channel, Some(s)),
            None => QUIZ_SESSION.clear(channel),
        };
        if !applied {
            return Err(QuizError::NotTeacher);
        }
        channel.flush();
        Ok(())
    }

    pub fn start_quiz(
        &mut self,
        channel: &mut SharedStateChannel<A, C>,
        quiz_id: &str,
    ) -> Result<(), QuizError> {
        self.ensure_teacher(channel)?;
        if let Some(session) = self.session(channel) {
            return Err(QuizError::InvalidTransition {
                action: "start quiz",
                status: Some(session.status),
            });
        }
        self.load_questions(channel, quiz_id)?;
        if self.questions.is_empty() {
            return Err(QuizError::NoQuestions);
        }
        // Fresh session: no carry-over from a previous run.
        self.my_answers.clear();
        self.all_answers.clear();
        self.observed_index = Some(0);
        self.observed_status = Some(QuizStatus::Active);
        self.write_session(
            channel,
            Some(QuizSessionState {
                quiz_id: quiz_id.to_string(),
                status: QuizStatus::Active,
                current_question_index: 0,
                question_started_at: Some(self.clock.now_ms()),
                show_results: false,
            }),
        )
    }

    /// Advances to the next question, or into review once the last
    /// question has run.
    pub fn next_question(
        &mut self,
        channel: &mut SharedStateChannel<A, C>,
    ) -> Result<QuizStatus, QuizError> {
        self.ensure_teacher(channel)?;
        let Some(mut session) = self.session(channel) else {
            return Err(QuizError::InvalidTransition {
                action: "advance question",
                status: None,
            });
        };
        if session.status != QuizStatus::Active {
            return Err(QuizError::InvalidTransition {
                action: "advance question",
                status: Some(session.status),
            });
        }
        if session.current_question_index + 1 < self.questions.len() {
            session.current_question_index += 1;
            session.question_started_at = Some(self.clock.now_ms());
        } else {
            session.status = QuizStatus::Reviewing;
            session.question_started_at = None;
        }
        let status = session.status;
        self.write_session(channel, Some(session))?;
        Ok(status)
    }

    /// Manual grading of a free-text answer during review. Does not move
    /// the session.
    pub fn grade_answer(
        &mut self,
        channel: &mut SharedStateChannel<A, C>,
        answer_id: &str,
        is_correct: bool,
    ) -> Result<(), QuizError> {
        self.ensure_teacher(channel)?;
        let status = self.session(channel).map(|s| s.status);
        if status != Some(QuizStatus::Reviewing) {
            return Err(QuizError::InvalidTransition {
                action: "grade answer",
                status,
            });
        }
        let result = self.api.call(
            "quiz.gradeAnswer",
            json!({
                "answerId": answer_id,
                "isCorrect": is_correct,
                "actor": channel.actor().to_json(),
            }),
        )?;
        let graded: Answer = serde_json::from_value(
            result.get("answer").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| QuizError::MalformedResponse(e.to_string()))?;
        if let Some(slot) = self
            .all_answers
            .iter_mut()
            .find(|a| a.answer_id == graded.answer_id)
        {
            *slot = graded;
        }
        Ok(())
    }

    pub fn end_quiz(&mut self, channel: &mut SharedStateChannel<A, C>) -> Result<(), QuizError> {
        self.ensure_teacher(channel)?;
        let Some(mut session) = self.session(channel) else {
            return Err(QuizError::InvalidTransition {
                action: "end quiz",
                status: None,
            });
        };
        if session.status != QuizStatus::Reviewing {
            return Err(QuizError::InvalidTransition {
                action: "end quiz",
                status: Some(session.status),
            });
        }
        session.status = QuizStatus::Finished;
        session.show_results = true;
        self.write_session(channel, Some(session))
    }

    /// Discards the finished session and its cached answers, returning
    /// the room to the quiz-authoring view.
    pub fn clear_session(
        &mut self,
        channel: &mut SharedStateChannel<A, C>,
    ) -> Result<(), QuizError> {
        self.ensure_teacher(channel)?;
        let status = self.session(channel).map(|s| s.status);
        if status != Some(QuizStatus::Finished) {
            return Err(QuizError::InvalidTransition {
                action: "clear session",
                status,
            });
        }
        self.loaded_quiz = None;
        self.questions.clear();
        self.my_answers.clear();
        self.all_answers.clear();
        self.observed_index = None;
        self.observed_status = None;
        self.write_session(channel, None)
    }

    /// Pulls every submitted answer for the session's quiz (teacher's
    /// review table).
    pub fn refresh_answers(
        &mut self,
        channel: &SharedStateChannel<A, C>,
    ) -> Result<(), QuizError> {
        self.ensure_teacher(channel)?;
        let Some(session) = self.session(channel) else {
            return Err(QuizError::InvalidTransition {
                action: "refresh answers",
                status: None,
            });
        };
        self.all_answers = self.fetch_answers(channel, &session.quiz_id)?;
        Ok(())
    }

    pub fn answers_for(&self, question_id: &str) -> Vec<&Answer> {
        self.all_answers
            .iter()
            .filter(|a| a.question_id == question_id)
            .collect()
    }

    // ---- student side ----

    /// Reconciles the machine with the session slot as currently visible
    /// through the channel: loads questions when a session appears,
    /// rebuilds the submission cache from scratch when the teacher moves
    /// the index (or the session status changes, so review grading shows
    /// up in the results view), and drops everything when the session is
    /// cleared.
    pub fn refresh(&mut self, channel: &SharedStateChannel<A, C>) -> Result<(), QuizError> {
        let Some(session) = self.session(channel) else {
            self.loaded_quiz = None;
            self.questions.clear();
            self.my_answers.clear();
            self.all_answers.clear();
            self.observed_index = None;
            self.observed_status = None;
            return Ok(());
        };
        let quiz_changed = self.loaded_quiz.as_deref() != Some(session.quiz_id.as_str());
        if quiz_changed {
            self.load_questions(channel, &session.quiz_id)?;
        }
        if quiz_changed
            || self.observed_index != Some(session.current_question_index)
            || self.observed_status != Some(session.status)
        {
            self.rebuild_my_answers(channel, &session.quiz_id)?;
            self.observed_index = Some(session.current_question_index);
            self.observed_status = Some(session.status);
        }
        Ok(())
    }

    /// Whether this user already submitted for the question currently on
    /// screen; gates the answer form against double submission.
    pub fn answered_current(&self, channel: &SharedStateChannel<A, C>) -> bool {
        self.current_question(channel)
            .map(|q| self.my_answers.contains_key(&q.question_id))
            .unwrap_or(false)
    }

    pub fn submit_answer(
        &mut self,
        channel: &SharedStateChannel<A, C>,
        text: &str,
    ) -> Result<Answer, QuizError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QuizError::EmptyAnswer);
        }
        let status = self.session(channel).map(|s| s.status);
        if status != Some(QuizStatus::Active) {
            return Err(QuizError::InvalidTransition {
                action: "submit answer",
                status,
            });
        }
        let question = self.current_question(channel).cloned().ok_or_else(|| {
            QuizError::MalformedResponse("active session without a current question".to_string())
        })?;
        if self.my_answers.contains_key(&question.question_id) {
            return Err(QuizError::AlreadyAnswered);
        }
        // Late submissions are rejected here, at the machine: the anchor
        // computation gives every client the same deadline, so there is
        // no server-side re-check.
        if self.remaining_for_current(channel) == Some(0) {
            return Err(QuizError::TimeExpired);
        }
        let result = self.api.call(
            "quiz.submitAnswer",
            json!({
                "questionId": question.question_id,
                "answerText": text,
                "actor": channel.actor().to_json(),
            }),
        )?;
        let answer: Answer = serde_json::from_value(
            result.get("answer").cloned().unwrap_or(serde_json::Value::Null),
        )
        .map_err(|e| QuizError::MalformedResponse(e.to_string()))?;
        self.my_answers
            .insert(answer.question_id.clone(), answer.clone());
        Ok(answer)
    }

    /// This user's score for the results view.
    pub fn my_score(&self) -> usize {
        correct_count(self.my_answers.values())
    }

    // ---- shared plumbing ----

    fn load_questions(
        &mut self,
        channel: &SharedStateChannel<A, C>,
        quiz_id: &str,
    ) -> Result<(), QuizError> {
        let result = self.api.call(
            "quiz.open",
            json!({ "quizId": quiz_id, "actor": channel.actor().to_json() }),
        )?;
        self.questions = serde_json::from_value(
            result
                .get("questions")
                .cloned()
                .unwrap_or_else(|| json!([])),
        )
        .map_err(|e| QuizError::MalformedResponse(e.to_string()))?;
        self.loaded_quiz = Some(quiz_id.to_string());
        Ok(())
    }

    fn fetch_answers(
        &mut self,
        channel: &SharedStateChannel<A, C>,
        quiz_id: &str,
    ) -> Result<Vec<Answer>, QuizError> {
        let result = self.api.call(
            "quiz.open",
            json!({
                "quizId": quiz_id,
                "includeAnswers": true,
                "actor": channel.actor().to_json(),
            }),
        )?;
        serde_json::from_value(
            result
                .get("answers")
                .cloned()
                .unwrap_or_else(|| json!([])),
        )
        .map_err(|e| QuizError::MalformedResponse(e.to_string()))
    }

    fn rebuild_my_answers(
        &mut self,
        channel: &SharedStateChannel<A, C>,
        quiz_id: &str,
    ) -> Result<(), QuizError> {
        // The server already filters a student's view down to their own
        // answers; this rebuild intentionally has no cross-question
        // carry-over from the previous cache.
        let answers = self.fetch_answers(channel, quiz_id)?;
        self.my_answers.clear();
        let me = channel.actor().user_id.clone();
        for a in answers {
            if a.user_id == me {
                self.my_answers.insert(a.question_id.clone(), a);
            }
        }
        Ok(())
    }
}
