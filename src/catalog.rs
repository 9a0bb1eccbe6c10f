use crate::error::QuestError;
use crate::model::{Difficulty, Level, NavigateAction, Row, TableDef, MAX_LEVEL, MIN_LEVEL};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

const MAX_HINTS: usize = 3;

/// Immutable id -> level map, built once at startup.
#[derive(Debug, Clone)]
pub struct LevelCatalog {
    levels: BTreeMap<u32, Level>,
}

impl LevelCatalog {
    pub fn from_levels(levels: Vec<Level>) -> Result<Self, QuestError> {
        let mut map = BTreeMap::new();
        for level in levels {
            check_level(&level)?;
            let id = level.id;
            if map.insert(id, level).is_some() {
                return Err(QuestError::InvalidLevel(format!("duplicate level id {id}")));
            }
        }
        if map.is_empty() {
            return Err(QuestError::InvalidLevel("catalog has no levels".into()));
        }
        Ok(Self { levels: map })
    }

    /// Loads a JSON array of level objects.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, QuestError> {
        let raw = std::fs::read_to_string(path)?;
        let levels: Vec<Level> = serde_json::from_str(&raw)?;
        Self::from_levels(levels)
    }

    pub fn builtin() -> Self {
        let levels = (MIN_LEVEL..=MAX_LEVEL).map(builtin_level).collect();
        Self::from_levels(levels).expect("built-in catalog is valid")
    }

    pub fn get(&self, id: u32) -> Option<&Level> {
        self.levels.get(&id)
    }

    /// All levels in ascending id order.
    pub fn levels(&self) -> impl Iterator<Item = &Level> {
        self.levels.values()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// `hint_level` is 1-based.
    pub fn hint(&self, level_id: u32, hint_level: u32) -> Option<&str> {
        let level = self.get(level_id)?;
        let idx = usize::try_from(hint_level).ok()?.checked_sub(1)?;
        level.hints.get(idx).map(String::as_str)
    }
}

pub fn progress_percentage(level: u32) -> u32 {
    let level = level.min(MAX_LEVEL);
    (level * 100 + MAX_LEVEL / 2) / MAX_LEVEL
}

pub fn navigate(current: u32, action: NavigateAction, target: Option<u32>) -> u32 {
    match action {
        NavigateAction::Next => current.saturating_add(1).min(MAX_LEVEL),
        NavigateAction::Previous => current.saturating_sub(1).max(MIN_LEVEL),
        NavigateAction::Jump => match target {
            Some(t) if (MIN_LEVEL..=MAX_LEVEL).contains(&t) => t,
            _ => current,
        },
        NavigateAction::Reset => current,
    }
}

fn type_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_ ]*(\(\s*\d+(\s*,\s*\d+)?\s*\))?$")
            .expect("valid type token regex")
    })
}

fn check_level(level: &Level) -> Result<(), QuestError> {
    let id = level.id;
    let invalid = |msg: String| QuestError::InvalidLevel(format!("level {id}: {msg}"));

    if !(MIN_LEVEL..=MAX_LEVEL).contains(&id) {
        return Err(invalid(format!("id must be within {MIN_LEVEL}..={MAX_LEVEL}")));
    }
    if level.hints.is_empty() || level.hints.len() > MAX_HINTS {
        return Err(invalid(format!("expected 1..={MAX_HINTS} hints")));
    }
    if level.max_score == 0 {
        return Err(invalid("maxScore must be positive".into()));
    }

    let mut names = HashSet::new();
    for table in &level.tables {
        if table.name.trim().is_empty() {
            return Err(invalid("table with empty name".into()));
        }
        if !names.insert(table.name.to_ascii_lowercase()) {
            return Err(invalid(format!("duplicate table {}", table.name)));
        }
        if table.schema.is_empty() {
            return Err(invalid(format!("table {} has no columns", table.name)));
        }
        for (column, ty) in &table.schema {
            if column.trim().is_empty() {
                return Err(invalid(format!("table {} has an unnamed column", table.name)));
            }
            if !type_token_re().is_match(ty.trim()) {
                return Err(invalid(format!(
                    "column {}.{column} has unsupported type {ty:?}",
                    table.name
                )));
            }
        }
        for row in &table.data {
            if let Some(key) = row.keys().find(|k| !table.schema.contains_key(*k)) {
                return Err(invalid(format!(
                    "seed row in {} uses undeclared column {key}",
                    table.name
                )));
            }
            if row.values().any(|v| v.is_array() || v.is_object()) {
                return Err(invalid(format!(
                    "seed row in {} holds a nested value",
                    table.name
                )));
            }
        }
    }
    Ok(())
}

// Built-in catalog

fn row<const N: usize>(cells: [(&str, Value); N]) -> Row {
    cells.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn table<const N: usize>(name: &str, columns: [(&str, &str); N], data: Vec<Row>) -> TableDef {
    TableDef {
        name: name.to_string(),
        schema: columns
            .into_iter()
            .map(|(c, t)| (c.to_string(), t.to_string()))
            .collect::<IndexMap<_, _>>(),
        data,
    }
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.into_iter().map(str::to_string).collect()
}

fn sample_table() -> TableDef {
    table(
        "sample_table",
        [("id", "INTEGER"), ("name", "TEXT"), ("value", "INTEGER")],
        vec![
            row([("id", json!(1)), ("name", json!("Item 1")), ("value", json!(100))]),
            row([("id", json!(2)), ("name", json!("Item 2")), ("value", json!(200))]),
            row([("id", json!(3)), ("name", json!("Item 3")), ("value", json!(300))]),
        ],
    )
}

fn first_select() -> Level {
    let users = vec![
        row([
            ("id", json!(1)),
            ("name", json!("Alice Johnson")),
            ("email", json!("alice@example.com")),
            ("age", json!(28)),
        ]),
        row([
            ("id", json!(2)),
            ("name", json!("Bob Smith")),
            ("email", json!("bob@example.com")),
            ("age", json!(34)),
        ]),
        row([
            ("id", json!(3)),
            ("name", json!("Carol Davis")),
            ("email", json!("carol@example.com")),
            ("age", json!(25)),
        ]),
    ];
    Level {
        id: 1,
        title: "Your First SELECT".into(),
        description: "Write a SQL query to select all columns from the 'users' table.".into(),
        difficulty: Difficulty::Beginner,
        story: None,
        objectives: None,
        starter_query: None,
        tables: vec![table(
            "users",
            [("id", "INTEGER"), ("name", "TEXT"), ("email", "TEXT"), ("age", "INTEGER")],
            users.clone(),
        )],
        expected_result: users,
        hints: strings([
            "Use the SELECT statement to retrieve data from a table.",
            "The asterisk (*) symbol selects all columns from a table.",
            "The complete query is: SELECT * FROM users;",
        ]),
        max_score: 100,
        time_limit: None,
        solution: Some("SELECT * FROM users;".into()),
    }
}

struct Exercise {
    title: &'static str,
    story: &'static str,
    description: &'static str,
    objectives: [&'static str; 2],
    tables: Vec<TableDef>,
    expected: Vec<Row>,
    hints: [&'static str; 3],
    solution: &'static str,
}

fn exercise(id: u32) -> Exercise {
    match id % 7 {
        1 => Exercise {
            title: "The Gatekeeper's Filter",
            story: "A watchman only allows items valued 200 or more into the vault.",
            description: "Return rows from sample_table where value >= 200.",
            objectives: ["Filter rows by numeric condition", "Return all columns"],
            tables: vec![sample_table()],
            expected: vec![
                row([("id", json!(2)), ("name", json!("Item 2")), ("value", json!(200))]),
                row([("id", json!(3)), ("name", json!("Item 3")), ("value", json!(300))]),
            ],
            hints: [
                "Use WHERE to keep only qualifying rows.",
                "Example: SELECT * FROM t WHERE col >= 10;",
                "Apply: SELECT * FROM sample_table WHERE value >= 200;",
            ],
            solution: "SELECT * FROM sample_table WHERE value >= 200;",
        },
        2 => Exercise {
            title: "The Archivist's Order",
            story: "The archivist demands the highest values displayed first.",
            description: "Return all rows ordered by value descending.",
            objectives: ["Sort results", "Use DESC order"],
            tables: vec![sample_table()],
            expected: vec![
                row([("id", json!(3)), ("name", json!("Item 3")), ("value", json!(300))]),
                row([("id", json!(2)), ("name", json!("Item 2")), ("value", json!(200))]),
                row([("id", json!(1)), ("name", json!("Item 1")), ("value", json!(100))]),
            ],
            hints: [
                "ORDER BY controls sorting.",
                "Example: SELECT * FROM t ORDER BY score DESC;",
                "Apply: SELECT * FROM sample_table ORDER BY value DESC;",
            ],
            solution: "SELECT * FROM sample_table ORDER BY value DESC;",
        },
        3 => Exercise {
            title: "The Whispering Crowd",
            story: "How many travelers from each city whisper your name?",
            description: "Count rows per city in attendees.",
            objectives: ["Aggregate counts", "Group by city"],
            tables: vec![table(
                "attendees",
                [("id", "INTEGER"), ("city", "TEXT")],
                vec![
                    row([("id", json!(1)), ("city", json!("Rome"))]),
                    row([("id", json!(2)), ("city", json!("Cairo"))]),
                    row([("id", json!(3)), ("city", json!("Rome"))]),
                ],
            )],
            expected: vec![
                row([("city", json!("Cairo")), ("COUNT(*)", json!(1))]),
                row([("city", json!("Rome")), ("COUNT(*)", json!(2))]),
            ],
            hints: [
                "COUNT(*) with GROUP BY makes per-group totals.",
                "Example: SELECT city, COUNT(*) FROM t GROUP BY city;",
                "Use table attendees.",
            ],
            solution: "SELECT city, COUNT(*) FROM attendees GROUP BY city;",
        },
        4 => Exercise {
            title: "The Twin Trails",
            story: "Reunite orders with their customers.",
            description: "Join orders and customers returning customer_name and order_total.",
            objectives: ["Inner join", "Select two columns"],
            tables: vec![
                table(
                    "customers",
                    [("id", "INTEGER"), ("customer_name", "TEXT")],
                    vec![
                        row([("id", json!(1)), ("customer_name", json!("Alice"))]),
                        row([("id", json!(2)), ("customer_name", json!("Bob"))]),
                    ],
                ),
                table(
                    "orders",
                    [("id", "INTEGER"), ("customer_id", "INTEGER"), ("order_total", "INTEGER")],
                    vec![
                        row([("id", json!(10)), ("customer_id", json!(1)), ("order_total", json!(50))]),
                        row([("id", json!(11)), ("customer_id", json!(2)), ("order_total", json!(75))]),
                    ],
                ),
            ],
            expected: vec![
                row([("customer_name", json!("Alice")), ("order_total", json!(50))]),
                row([("customer_name", json!("Bob")), ("order_total", json!(75))]),
            ],
            hints: [
                "JOIN tables on matching keys.",
                "Example: ... FROM a JOIN b ON a.id = b.a_id",
                "Apply: customers c JOIN orders o ON c.id = o.customer_id",
            ],
            solution: "SELECT c.customer_name, o.order_total FROM customers c \
                       JOIN orders o ON c.id = o.customer_id;",
        },
        5 => Exercise {
            title: "The Hidden Keep",
            story: "Only patrons spending above the realm's average may enter.",
            description: "Return customers whose total spend exceeds average order_total.",
            objectives: ["Subquery for AVG", "Group and filter"],
            tables: vec![table(
                "orders",
                [("id", "INTEGER"), ("customer", "TEXT"), ("total", "INTEGER")],
                vec![
                    row([("id", json!(1)), ("customer", json!("A")), ("total", json!(50))]),
                    row([("id", json!(2)), ("customer", json!("A")), ("total", json!(100))]),
                    row([("id", json!(3)), ("customer", json!("B")), ("total", json!(40))]),
                ],
            )],
            expected: vec![row([("customer", json!("A"))])],
            hints: [
                "Compute AVG(total) in a subquery.",
                "Group by customer to SUM their totals.",
                "Filter SUM(total) > (SELECT AVG(total) FROM orders)",
            ],
            solution: "SELECT customer FROM orders GROUP BY customer \
                       HAVING SUM(total) > (SELECT AVG(total) FROM orders);",
        },
        6 => Exercise {
            title: "Council of Hundreds",
            story: "Only cities with at least 2 statues are honored.",
            description: "Return cities with count >= 2.",
            objectives: ["GROUP BY", "HAVING filter"],
            tables: vec![table(
                "statues",
                [("id", "INTEGER"), ("city", "TEXT")],
                vec![
                    row([("id", json!(1)), ("city", json!("Athens"))]),
                    row([("id", json!(2)), ("city", json!("Athens"))]),
                    row([("id", json!(3)), ("city", json!("Sparta"))]),
                ],
            )],
            expected: vec![row([("city", json!("Athens")), ("COUNT(*)", json!(2))])],
            hints: [
                "Use HAVING for aggregated conditions.",
                "Example: ... GROUP BY city HAVING COUNT(*) >= 2",
                "Apply to table statues.",
            ],
            solution: "SELECT city, COUNT(*) FROM statues GROUP BY city HAVING COUNT(*) >= 2;",
        },
        _ => Exercise {
            title: "The Time Weaver",
            story: "Rank deliveries by speed within each courier's realm.",
            description: "Return courier, delivery_id and delivery_rank (RANK by delivery_time per courier).",
            objectives: ["RANK() OVER", "PARTITION BY and ORDER BY"],
            tables: vec![table(
                "deliveries",
                [("delivery_id", "INTEGER"), ("courier", "TEXT"), ("delivery_time", "INTEGER")],
                vec![
                    row([("delivery_id", json!(1)), ("courier", json!("X")), ("delivery_time", json!(30))]),
                    row([("delivery_id", json!(2)), ("courier", json!("X")), ("delivery_time", json!(20))]),
                    row([("delivery_id", json!(3)), ("courier", json!("Y")), ("delivery_time", json!(25))]),
                ],
            )],
            expected: vec![
                row([("courier", json!("X")), ("delivery_id", json!(2)), ("delivery_rank", json!(1))]),
                row([("courier", json!("X")), ("delivery_id", json!(1)), ("delivery_rank", json!(2))]),
                row([("courier", json!("Y")), ("delivery_id", json!(3)), ("delivery_rank", json!(1))]),
            ],
            hints: [
                "Window functions keep rows while computing across partitions.",
                "Example: RANK() OVER (PARTITION BY team ORDER BY score DESC)",
                "Apply: PARTITION BY courier ORDER BY delivery_time ASC, aliased AS delivery_rank",
            ],
            solution: "SELECT courier, delivery_id, \
                       RANK() OVER (PARTITION BY courier ORDER BY delivery_time ASC) AS delivery_rank \
                       FROM deliveries;",
        },
    }
}

fn builtin_level(id: u32) -> Level {
    if id == MIN_LEVEL {
        return first_select();
    }
    let ex = exercise(id);
    Level {
        id,
        title: ex.title.into(),
        description: ex.description.into(),
        difficulty: Difficulty::for_level(id).unwrap_or(Difficulty::Expert),
        story: Some(ex.story.into()),
        objectives: Some(strings(ex.objectives)),
        starter_query: None,
        tables: ex.tables,
        expected_result: ex.expected,
        hints: strings(ex.hints),
        max_score: 100,
        time_limit: None,
        solution: Some(ex.solution.into()),
    }
}
