//! A scripted stand-in for the database

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use serde_json::Value;
use xlens_client::{SqlResponse, StatusCode};

use crate::SqlExecutor;

/// What the fake database answers to a matching statement
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Rows(Vec<Vec<Value>>),
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub(crate) stmt: String,
    pub(crate) args: Vec<Value>,
}

#[derive(Debug)]
struct Rule {
    needles: Vec<String>,
    /// Replies are consumed in order; the last one repeats forever
    replies: VecDeque<Reply>,
}

impl Rule {
    fn matches(&self, stmt: &str) -> bool {
        self.needles.iter().all(|n| stmt.contains(n.as_str()))
    }

    fn next_reply(&mut self) -> Reply {
        if self.replies.len() > 1 {
            self.replies.pop_front().expect("checked length")
        } else {
            self.replies.front().cloned().expect("rules have a reply")
        }
    }
}

/// Answers statements from rules matched by substring, first match wins. Unmatched statements
/// succeed with no rows. Every call is recorded.
#[derive(Debug, Default)]
pub(crate) struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(self, needle: &str, reply: Reply) -> Self {
        self.on_all(&[needle], reply)
    }

    /// Reply to statements containing every one of `needles`. Repeating the same needles queues
    /// another reply.
    pub(crate) fn on_all(self, needles: &[&str], reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            let needles: Vec<String> = needles.iter().map(|n| n.to_string()).collect();
            match rules.iter_mut().find(|r| r.needles == needles) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needles,
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn statements_containing(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.stmt)
            .filter(|s| s.contains(needle))
            .collect()
    }
}

#[async_trait]
impl SqlExecutor for ScriptedExecutor {
    async fn execute(&self, stmt: &str, args: &[Value]) -> xlens_client::Result<SqlResponse> {
        self.calls.lock().unwrap().push(Call {
            stmt: stmt.to_string(),
            args: args.to_vec(),
        });
        let reply = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| r.matches(stmt))
                .map(Rule::next_reply)
        };
        match reply {
            None => Ok(SqlResponse::default()),
            Some(Reply::Rows(rows)) => Ok(SqlResponse {
                rowcount: Some(rows.len() as i64),
                rows,
                ..Default::default()
            }),
            Some(Reply::Error(message)) => Err(xlens_client::Error::ApiError {
                code: StatusCode::INTERNAL_SERVER_ERROR,
                message,
            }),
        }
    }
}
