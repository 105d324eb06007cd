//! JSON summaries printed by the CLI.
use edgelake_core::matcher::MatchDefinition;
use edgelake_services::{Handled, Outcome, Serviceable};
use serde::Serialize;

#[derive(Serialize)]
pub struct Pick {
    kind: String,
    id: String,
    project: String,
    commit: String,
    asset: String,
    score: u32,
}

impl Pick {
    pub fn new(serviceable: &Serviceable, matcher: &MatchDefinition) -> Self {
        Self {
            kind: serviceable.kind().to_string(),
            id: serviceable.id().to_string(),
            project: serviceable.project().to_string(),
            commit: serviceable.commit().to_string(),
            asset: serviceable.asset_id().to_string(),
            score: serviceable.match_index(matcher).value(),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Served {
    Served {
        status: u16,
        content_type: Option<String>,
        bytes: usize,
        elapsed_us: u128,
    },
    Executed {
        code: u32,
        elapsed_us: u128,
    },
}

impl Served {
    pub fn new(handled: &Handled) -> Self {
        let elapsed_us = handled.started.elapsed().as_micros();
        match &handled.outcome {
            Outcome::Served(resp) => Served::Served {
                status: resp.status().as_u16(),
                content_type: resp
                    .headers()
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                bytes: resp.body().len(),
                elapsed_us,
            },
            Outcome::Executed { code } => Served::Executed {
                code: *code,
                elapsed_us,
            },
        }
    }
}

pub fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
