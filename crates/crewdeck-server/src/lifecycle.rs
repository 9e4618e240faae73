use std::sync::Arc;

use chrono::Utc;
use crewdeck_bridge::TmuxBridge;
use crewdeck_store::queries::{agent, persona, project};
use crewdeck_store::records::PersonaRecord;
use crewdeck_store::Storage;
use crewdeck_types::AgentId;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tokens::SessionTokenService;

/// What `create` returns immediately. Full readiness (`prompt_injected_at`)
/// is reported asynchronously by the hook pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct CreationReceipt {
    pub agent_id: AgentId,
    pub tmux_session_name: String,
    pub tmux_pane_id: Option<String>,
    pub project_slug: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownOutcome {
    Initiated,
    AlreadyTerminated,
}

/// Creates and terminates agents and delivers persona / successor
/// injections through the terminal bridge.
pub struct AgentLifecycle {
    storage: Storage,
    bridge: Arc<TmuxBridge>,
    tokens: Arc<SessionTokenService>,
    guardrails_document: String,
}

impl AgentLifecycle {
    pub fn new(
        storage: Storage,
        bridge: Arc<TmuxBridge>,
        tokens: Arc<SessionTokenService>,
        guardrails_document: String,
    ) -> Self {
        Self {
            storage,
            bridge,
            tokens,
            guardrails_document,
        }
    }

    pub fn guardrails_hash(&self) -> String {
        guardrails_hash(&self.guardrails_document)
    }

    pub async fn create(
        &self,
        project_id: i64,
        persona_slug: Option<&str>,
        previous_agent_id: Option<AgentId>,
    ) -> Result<CreationReceipt> {
        let db = self.storage.connect()?;

        let project_row = project::get(db.conn(), project_id)?
            .ok_or_else(|| Error::Domain(format!("project {project_id} does not exist")))?;
        if !std::path::Path::new(&project_row.path).is_dir() {
            return Err(Error::Domain(format!(
                "project path {} does not exist on disk",
                project_row.path
            )));
        }

        let persona_row = match persona_slug {
            Some(slug) => {
                let found = persona::get_by_slug(db.conn(), slug)?
                    .ok_or_else(|| Error::Domain(format!("persona {slug} does not exist")))?;
                if !persona::is_active(&found) {
                    return Err(Error::Domain(format!("persona {slug} is not active")));
                }
                Some(found)
            }
            None => None,
        };

        if !TmuxBridge::is_installed().await {
            return Err(Error::Unavailable("tmux is not installed".to_string()));
        }

        let session_name = mint_session_name(&project_row.slug);
        self.bridge
            .new_session(&session_name, &project_row.path, "claude")
            .await?;
        let pane_id = self.bridge.first_pane_of_session(&session_name).await?;

        let agent_id = agent::insert(
            db.conn(),
            &agent::NewAgent {
                session_uuid: &format!("pending-{}", Uuid::new_v4()),
                project_id,
                persona_id: persona_row.as_ref().map(|p| p.id),
                position_id: None,
                previous_agent_id,
                tmux_session_name: Some(&session_name),
                tmux_pane_id: pane_id.as_deref(),
                started_at: Utc::now(),
            },
        )?;

        if let (Some(persona_row), Some(pane)) = (persona_row.as_ref(), pane_id.as_deref()) {
            self.inject_persona(agent_id, pane, persona_row).await?;
        }
        if let (Some(previous), Some(pane)) = (previous_agent_id, pane_id.as_deref()) {
            let has_handoff = agent::has_handoff(db.conn(), previous)?;
            let message = successor_message(previous, has_handoff);
            self.bridge.send_text(pane, &message).await?;
        }

        Ok(CreationReceipt {
            agent_id,
            tmux_session_name: session_name,
            tmux_pane_id: pane_id,
            project_slug: project_row.slug,
        })
    }

    /// Non-blocking: sends `/exit` and returns; `session_end` lands through
    /// the hook pipeline when the REPL actually dies.
    pub async fn shutdown(&self, agent_id: AgentId) -> Result<ShutdownOutcome> {
        let db = self.storage.connect()?;
        let agent_row = agent::get(db.conn(), agent_id)?
            .ok_or_else(|| Error::NotFound(format!("agent {agent_id} does not exist")))?;

        if agent_row.ended_at.is_some() {
            return Ok(ShutdownOutcome::AlreadyTerminated);
        }
        let Some(pane) = agent_row.tmux_pane_id.as_deref() else {
            return Err(Error::Domain("agent has no pane to signal".to_string()));
        };

        self.tokens.revoke_for_agent(agent_id);

        let bridge = Arc::clone(&self.bridge);
        let pane = pane.to_string();
        tokio::spawn(async move {
            if let Err(err) = bridge.send_text(&pane, "/exit").await {
                tracing::warn!(%pane, %err, "exit delivery failed");
            }
            bridge.release_send_lock(&pane);
        });
        Ok(ShutdownOutcome::Initiated)
    }

    /// Persona skill + optional experience + the platform guardrails, in one
    /// paste, with the guardrail version stamped on the agent.
    async fn inject_persona(
        &self,
        agent_id: AgentId,
        pane: &str,
        persona_row: &PersonaRecord,
    ) -> Result<()> {
        let skill = persona_row
            .description
            .clone()
            .unwrap_or_else(|| format!("You are {}.", persona_row.name));
        let injection = assemble_injection(&skill, None, &self.guardrails_document);
        self.bridge.send_text(pane, &injection).await?;

        let db = self.storage.connect()?;
        agent::set_guardrails_hash(db.conn(), agent_id, &self.guardrails_hash())?;
        agent::set_prompt_injected(db.conn(), agent_id, Utc::now())?;
        Ok(())
    }
}

/// `hs-<project-slug>-<nonce>`: unique per spawn, stable prefix per project.
pub fn mint_session_name(project_slug: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("hs-{}-{}", project_slug, &nonce[..8])
}

/// SHA-256 of the guardrail document; stamped on each injected agent so a
/// guardrail rollout is observable per agent.
pub fn guardrails_hash(document: &str) -> String {
    format!("{:x}", Sha256::digest(document.as_bytes()))
}

pub fn assemble_injection(skill: &str, experience: Option<&str>, guardrails: &str) -> String {
    let mut sections = vec![skill.trim().to_string()];
    if let Some(experience) = experience {
        sections.push(experience.trim().to_string());
    }
    sections.push(format!("Platform guardrails:\n{}", guardrails.trim()));
    sections.join("\n\n")
}

/// A successor with a recorded handoff gets the handoff brief; one without
/// is a bare revival pointed at its predecessor's transcript.
pub fn successor_message(previous_agent_id: AgentId, has_handoff: bool) -> String {
    if has_handoff {
        format!(
            "You are taking over from agent #{previous_agent_id} via a planned handoff. \
             Review the handoff notes before continuing their work."
        )
    } else {
        format!(
            "You are a revival of agent #{previous_agent_id}. Read your predecessor's \
             transcript to recover context before doing anything else."
        )
    }
}
