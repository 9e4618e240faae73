use chrono::Utc;
use crewdeck_store::queries::event::EventRefs;
use crewdeck_store::queries::{agent, command, objective, project, turn};
use crewdeck_store::{Result, Storage};
use crewdeck_types::{AgentId, InferenceLevel};
use serde::Deserialize;
use serde_json::json;

use crate::oracle::CachingOracle;

/// One scored agent, as returned by the oracle.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PriorityVerdict {
    pub agent_id: AgentId,
    pub score: i64,
    pub reason: String,
}

/// Periodic batch scorer: every active agent against the current objective.
pub struct PriorityScorer {
    storage: Storage,
    oracle: CachingOracle,
}

impl PriorityScorer {
    pub fn new(storage: Storage, oracle: CachingOracle) -> Self {
        Self { storage, oracle }
    }

    /// Score one batch. Returns the verdicts that were applied, so the
    /// caller can refresh one card per change.
    pub fn run_once(&self) -> Result<Vec<PriorityVerdict>> {
        let db = self.storage.connect()?;

        let Some(current_objective) = objective::current(db.conn())? else {
            return Ok(Vec::new());
        };
        if !current_objective.priority_enabled {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for agent_row in agent::list_live(db.conn())? {
            let Some(project_row) = project::get(db.conn(), agent_row.project_id)? else {
                continue;
            };
            if project_row.inference_paused {
                continue;
            }
            let current = command::current_for_agent(db.conn(), agent_row.id)?;
            let last_turn_summary = turn::latest_for_agent(db.conn(), agent_row.id)?
                .and_then(|t| t.summary.or(Some(t.text)));
            candidates.push(json!({
                "agent_id": agent_row.id,
                "state": current
                    .as_ref()
                    .map(|c| c.state.as_str())
                    .unwrap_or("idle"),
                "instruction": current.as_ref().and_then(|c| c.instruction.clone().or_else(|| c.full_command.clone())),
                "last_turn_summary": last_turn_summary,
            }));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let prompt = format!(
            "Objective: {}\n\nAgents:\n{}\n\nScore each agent 0-100 for how much its current \
             work advances the objective. Respond with a JSON array of \
             {{\"agent_id\": int, \"score\": int, \"reason\": string}}.",
            current_objective.text,
            serde_json::to_string_pretty(&candidates)
                .map_err(crewdeck_store::Error::from)?
        );

        let refs = EventRefs {
            project_id: None,
            agent_id: candidates
                .first()
                .and_then(|c| c["agent_id"].as_i64()),
            ..Default::default()
        };
        let (output, _cached) = self.oracle.infer(InferenceLevel::Priority, &prompt, refs)?;
        let verdicts = parse_verdicts(&output)?;

        let now = Utc::now();
        let mut applied = Vec::new();
        for verdict in verdicts {
            let score = verdict.score.clamp(0, 100);
            match agent::set_priority(db.conn(), verdict.agent_id, score, &verdict.reason, now) {
                Ok(()) => applied.push(PriorityVerdict { score, ..verdict }),
                Err(err) => {
                    tracing::warn!(agent = verdict.agent_id, %err, "priority write skipped");
                }
            }
        }
        Ok(applied)
    }
}

/// Parse the oracle's verdict array, tolerating a fenced code block around
/// the JSON.
pub fn parse_verdicts(output: &str) -> Result<Vec<PriorityVerdict>> {
    let trimmed = output.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim())
        .map_err(|e| crewdeck_store::Error::Query(format!("Unparseable priority verdict: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Oracle;
    use crewdeck_store::queries::{agent as agent_q, project as project_q};
    use std::sync::Arc;

    fn seed(storage: &Storage, count: usize) -> Vec<AgentId> {
        let db = storage.connect().unwrap();
        let project_id = project_q::insert(
            db.conn(),
            &project_q::NewProject {
                slug: "p",
                name: "P",
                path: "/p",
                git_origin: None,
                git_branch: None,
            },
        )
        .unwrap();
        (0..count)
            .map(|i| {
                agent_q::insert(
                    db.conn(),
                    &agent_q::NewAgent {
                        session_uuid: &format!("S{i}"),
                        project_id,
                        persona_id: None,
                        position_id: None,
                        previous_agent_id: None,
                        tmux_session_name: None,
                        tmux_pane_id: None,
                        started_at: Utc::now(),
                    },
                )
                .unwrap()
            })
            .collect()
    }

    fn scoring_oracle(ids: Vec<AgentId>) -> Arc<dyn Oracle> {
        Arc::new(move |_prompt: &str| {
            let verdicts: Vec<_> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    json!({"agent_id": id, "score": 60 + i as i64, "reason": "aligned"})
                })
                .collect();
            Ok(serde_json::to_string(&verdicts).unwrap())
        })
    }

    #[test]
    fn scores_every_active_agent_with_full_triplets() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("p.db")).unwrap();
        let ids = seed(&storage, 3);
        {
            let db = storage.connect().unwrap();
            objective::set_current(db.conn(), "Ship auth", true, Utc::now()).unwrap();
        }

        let scorer = PriorityScorer::new(
            storage.clone(),
            CachingOracle::new(storage.clone(), scoring_oracle(ids.clone())),
        );
        let applied = scorer.run_once().unwrap();
        assert_eq!(applied.len(), 3);

        let db = storage.connect().unwrap();
        for id in ids {
            let agent_row = agent_q::get(db.conn(), id).unwrap().unwrap();
            let score = agent_row.priority_score.unwrap();
            assert!((0..=100).contains(&score));
            assert!(agent_row.priority_reason.is_some());
            assert!(agent_row.priority_updated_at.is_some());
        }
    }

    #[test]
    fn disabled_objective_scores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("p.db")).unwrap();
        let ids = seed(&storage, 1);
        {
            let db = storage.connect().unwrap();
            objective::set_current(db.conn(), "Ship auth", false, Utc::now()).unwrap();
        }

        let scorer = PriorityScorer::new(
            storage.clone(),
            CachingOracle::new(storage.clone(), scoring_oracle(ids)),
        );
        assert!(scorer.run_once().unwrap().is_empty());
    }

    #[test]
    fn paused_projects_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("p.db")).unwrap();
        let ids = seed(&storage, 2);
        {
            let db = storage.connect().unwrap();
            objective::set_current(db.conn(), "Ship auth", true, Utc::now()).unwrap();
            project_q::set_inference_paused(db.conn(), 1, true, Some("cost"), Utc::now()).unwrap();
        }

        let scorer = PriorityScorer::new(
            storage.clone(),
            CachingOracle::new(storage.clone(), scoring_oracle(ids)),
        );
        assert!(scorer.run_once().unwrap().is_empty());
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().join("p.db")).unwrap();
        let ids = seed(&storage, 1);
        {
            let db = storage.connect().unwrap();
            objective::set_current(db.conn(), "Ship auth", true, Utc::now()).unwrap();
        }

        let id = ids[0];
        let oracle: Arc<dyn Oracle> = Arc::new(move |_: &str| {
            Ok(format!(
                "```json\n[{{\"agent_id\": {id}, \"score\": 250, \"reason\": \"overshoot\"}}]\n```"
            ))
        });
        let scorer = PriorityScorer::new(storage.clone(), CachingOracle::new(storage.clone(), oracle));
        let applied = scorer.run_once().unwrap();
        assert_eq!(applied[0].score, 100);
    }

    #[test]
    fn parse_tolerates_fenced_output() {
        let fenced = "```json\n[{\"agent_id\": 1, \"score\": 10, \"reason\": \"r\"}]\n```";
        let verdicts = parse_verdicts(fenced).unwrap();
        assert_eq!(verdicts.len(), 1);

        assert!(parse_verdicts("not json").is_err());
    }
}
