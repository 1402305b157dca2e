//! Tool-call dispatch.
//!
//! The router resolves a function name to its skill, applies the approval
//! policy, then runs the call in the sandbox or in-process. Approval
//! outcomes come back as plain result text; only real skill or sandbox
//! failures surface as [`ToolError`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::agent::memory::FactStore;
use crate::config::{Config, SkillsConfig};
use crate::error::{ApprovalError, ToolError};
use crate::gateway::Notifier;
use crate::hitl::{ApprovalDecision, ApprovalPresenter, HitlManager};
use crate::sandbox::{SandboxExecutor, SandboxLimits, SandboxRunSpec, Upload, NETWORK_NONE};
use crate::skills::{ResolvedSkill, SkillContext, SkillDefinition, SkillRegistry, UserSkillStore};

/// Function name the interpreter image dispatches user-written code under.
pub const USER_SKILL_FUNCTION: &str = "run_user_skill";

/// Who is calling, and what they sent along.
#[derive(Clone, Default)]
pub struct RequestContext {
    pub user_id: i64,
    pub chat_id: i64,
    /// Where approval prompts go. Without one, gated tools are refused.
    pub presenter: Option<Arc<dyn ApprovalPresenter>>,
    pub upload: Option<Upload>,
}

impl RequestContext {
    pub fn new(user_id: i64, chat_id: i64) -> Self {
        Self {
            user_id,
            chat_id,
            ..Self::default()
        }
    }

    pub fn with_presenter(mut self, presenter: Arc<dyn ApprovalPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    pub fn with_upload(mut self, upload: Option<Upload>) -> Self {
        self.upload = upload;
        self
    }
}

pub struct ToolRouter {
    registry: Arc<SkillRegistry>,
    skills_config: SkillsConfig,
    limits: SandboxLimits,
    user_skill_image: String,
    sandbox: Option<Arc<SandboxExecutor>>,
    hitl: Option<Arc<HitlManager>>,
    facts: Option<Arc<dyn FactStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    user_skills: Option<Arc<dyn UserSkillStore>>,
}

impl ToolRouter {
    pub fn new(registry: Arc<SkillRegistry>, config: &Config) -> Self {
        Self {
            registry,
            skills_config: config.skills.clone(),
            limits: SandboxLimits::from(&config.sandbox),
            user_skill_image: config.sandbox.python_image.clone(),
            sandbox: None,
            hitl: None,
            facts: None,
            notifier: None,
            user_skills: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<SandboxExecutor>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_hitl(mut self, hitl: Arc<HitlManager>) -> Self {
        self.hitl = Some(hitl);
        self
    }

    pub fn with_facts(mut self, facts: Arc<dyn FactStore>) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_user_skills(mut self, store: Arc<dyn UserSkillStore>) -> Self {
        self.user_skills = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    pub fn has_sandbox(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Runs one tool call and returns the text fed back to the model.
    pub async fn execute(
        &self,
        function: &str,
        arguments: Value,
        ctx: &RequestContext,
    ) -> Result<String, ToolError> {
        let Some(resolved) = self.registry.resolve(function) else {
            warn!("Unknown tool requested: {function}");
            return Ok(format!("Unknown tool: {function}"));
        };
        let definition = &resolved.definition;

        if definition.needs_approval(function) {
            if let Some(refusal) = self.gate(function, &arguments, definition, ctx).await {
                return Ok(refusal);
            }
        }

        self.dispatch(function, arguments, &resolved, ctx)
            .await
            .map_err(|cause| {
                warn!("Tool {} ({function}) failed: {cause}", definition.name);
                ToolError::new(&definition.name, cause)
            })
    }

    // ── Approval ─────────────────────────────────────────

    /// Asks for approval. `Some(text)` means the call must not run.
    async fn gate(
        &self,
        function: &str,
        arguments: &Value,
        definition: &SkillDefinition,
        ctx: &RequestContext,
    ) -> Option<String> {
        let (Some(hitl), Some(presenter)) = (&self.hitl, &ctx.presenter) else {
            warn!("{function} needs approval but no approval channel is available");
            return Some(format!(
                "Approval required for {function}, but no approval channel is available."
            ));
        };

        match hitl
            .request_approval(presenter.as_ref(), function, arguments, definition.user_created)
            .await
        {
            Ok(ApprovalDecision::Approve) => None,
            Ok(ApprovalDecision::Trust) => {
                self.persist_trust(ctx.user_id, &definition.name).await;
                None
            }
            Ok(ApprovalDecision::Deny) => Some(format!("User denied execution of {function}.")),
            Err(ApprovalError::Timeout { .. }) => Some(format!("Approval for {function} timed out.")),
            Err(e) => {
                warn!("Approval for {function} failed: {e}");
                Some(format!("Approval for {function} could not be obtained: {e}"))
            }
        }
    }

    async fn persist_trust(&self, user_id: i64, skill: &str) {
        if let Some(store) = &self.user_skills {
            match store.set_trusted(user_id, skill, true).await {
                Ok(true) => {}
                Ok(false) => warn!("Trusted skill {skill} not found in store for user {user_id}"),
                Err(e) => warn!("Could not persist trust for {skill}: {e}"),
            }
        }
        self.registry.set_user_skill_trusted(skill, true);
        info!("User {user_id} trusted skill {skill}");
    }

    // ── Dispatch ─────────────────────────────────────────

    async fn dispatch(
        &self,
        function: &str,
        arguments: Value,
        resolved: &ResolvedSkill,
        ctx: &RequestContext,
    ) -> anyhow::Result<String> {
        let definition = &resolved.definition;

        if let Some(sandbox) = &self.sandbox {
            if definition.user_created {
                let spec = self.user_skill_spec(function, arguments, definition, ctx);
                return Ok(sandbox.run(spec).await?);
            }
            if definition.sandboxed {
                let spec = self.builtin_spec(function, arguments, definition, ctx);
                return Ok(sandbox.run(spec).await?);
            }
        } else if definition.sandboxed {
            debug!("No sandbox configured, {function} runs its in-process fallback");
        }

        let context = SkillContext {
            user_id: ctx.user_id,
            chat_id: ctx.chat_id,
            facts: self.facts.clone(),
            notifier: self.notifier.clone(),
            user_skills: self.user_skills.clone(),
            registry: Arc::clone(&self.registry),
        };
        resolved.skill.execute(function, arguments, &context).await
    }

    fn user_skill_spec(
        &self,
        function: &str,
        arguments: Value,
        definition: &SkillDefinition,
        ctx: &RequestContext,
    ) -> SandboxRunSpec {
        let input = json!({
            "function": USER_SKILL_FUNCTION,
            "arguments": {
                "code": definition.code.as_deref().unwrap_or_default(),
                "arguments": arguments,
            },
        });
        debug!("Running user skill {function} in {}", self.user_skill_image);
        self.attach_upload(
            SandboxRunSpec::new(&self.user_skill_image, input, &self.limits).with_network(NETWORK_NONE),
            ctx,
        )
    }

    fn builtin_spec(
        &self,
        function: &str,
        arguments: Value,
        definition: &SkillDefinition,
        ctx: &RequestContext,
    ) -> SandboxRunSpec {
        let input = json!({"function": function, "arguments": arguments});
        let spec = SandboxRunSpec::new(&definition.sandbox_image, input, &self.limits)
            .with_network(&definition.network_mode)
            .with_env(self.secret_env(definition));
        self.attach_upload(spec, ctx)
    }

    /// Only the keys the skill declares, and only those with a value.
    fn secret_env(&self, definition: &SkillDefinition) -> BTreeMap<String, String> {
        self.skills_config
            .secrets_for(&definition.name)
            .into_iter()
            .filter(|(key, _)| definition.secret_keys.contains(key))
            .collect()
    }

    fn attach_upload(&self, spec: SandboxRunSpec, ctx: &RequestContext) -> SandboxRunSpec {
        match &ctx.upload {
            Some(upload) => spec.with_upload(upload.clone(), &self.limits),
            None => spec,
        }
    }
}
