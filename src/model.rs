use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MIN_LEVEL: u32 = 1;
pub const MAX_LEVEL: u32 = 100;

/// One result or seed row. Keys keep the engine's (or author's) column order.
pub type Row = IndexMap<String, Value>;

/// JSON form of a floating point cell. Whole values become integers, so a
/// REAL `100.0` reads and grades as `100`.
pub fn real_to_json(f: f64) -> Value {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        return Value::Number((f as i64).into());
    }
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

impl Difficulty {
    pub fn for_level(id: u32) -> Option<Self> {
        match id {
            1..=20 => Some(Difficulty::Beginner),
            21..=50 => Some(Difficulty::Intermediate),
            51..=80 => Some(Difficulty::Advanced),
            81..=100 => Some(Difficulty::Expert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// Column name -> declared type token, in declaration order.
    pub schema: IndexMap<String, String>,
    #[serde(default)]
    pub data: Vec<Row>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub id: u32,
    pub title: String,
    pub description: String,
    pub difficulty: Difficulty,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectives: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starter_query: Option<String>,
    pub tables: Vec<TableDef>,
    pub expected_result: Vec<Row>,
    pub hints: Vec<String>,
    pub max_score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u32>,
    /// Reference answer used to prove the level is solvable. Never sent to clients.
    #[serde(default, skip_serializing)]
    pub solution: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelSummary {
    pub id: u32,
    pub title: String,
    pub difficulty: Difficulty,
}

impl From<&Level> for LevelSummary {
    fn from(level: &Level) -> Self {
        Self {
            id: level.id,
            title: level.title.clone(),
            difficulty: level.difficulty,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whole milliseconds spent on the request, validation failures included.
    pub execution_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_earned: Option<u32>,
}

impl QueryResult {
    pub fn failed(error: impl Into<String>, execution_time: u64) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            execution_time,
            is_correct: Some(false),
            ..Default::default()
        }
    }

    pub fn is_correct(&self) -> bool {
        self.is_correct.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    pub id: String,
    pub current_level: u32,
    pub score: u64,
    pub hints_used: u32,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NavigateAction {
    Next,
    Previous,
    Jump,
    Reset,
}
