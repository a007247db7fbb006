// Ties everything together for one user request:
// permissions, character, prompt, workflow, dispatch, and the bookkeeping afterwards.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::{
    catalog::ModelCatalog,
    characters::{Character, CharacterBook},
    config::{AppConfig, ConfigModule},
    db::DatabaseModule,
    dispatcher::{Backend, Dispatcher, Job, JobOutcome},
    patcher::{self, GenerationOptions},
    permissions::Permissions,
    prompt::{self, Completion, PromptMode},
    storage::{ImageArchive, SeedStore, TempWorkflowStore},
    workflow::Workflow,
};

#[derive(Clone)]
pub struct Studio {
    config: ConfigModule,
    db: DatabaseModule,
    backend: Arc<dyn Backend>,
    llm: Arc<dyn Completion>,
}

/// What a request works with. Everything is read fresh per request.
struct RequestContext {
    config: AppConfig,
    permissions: Permissions,
    character: Character,
}

impl Studio {
    pub fn new(config: ConfigModule, db: DatabaseModule, backend: Arc<dyn Backend>, llm: Arc<dyn Completion>) -> Self {
        Self {
            config,
            db,
            backend,
            llm,
        }
    }

    async fn context(&self, user: &str, character: &str) -> Result<RequestContext> {
        let config = self.config.snapshot().await;
        let permissions = self.db.permissions(user).await?;
        let book = CharacterBook::load(&config.paths.characters())?;
        let character = book.get(character)?.clone();
        permissions.require_generate(&character.name)?;
        Ok(RequestContext {
            config,
            permissions,
            character,
        })
    }

    fn temp_store(config: &AppConfig) -> TempWorkflowStore {
        TempWorkflowStore::new(config.paths.temp_workflows())
    }

    /// Sessions are per user; nobody can pick up someone else's workflow by naming their session.
    fn session_key(user: &str, session: &str) -> String {
        format!("{}/{}", user, session)
    }

    fn patch_and_store(ctx: &RequestContext, session: &str, options: &GenerationOptions) -> Result<PathBuf> {
        let template = ctx.character.load_template(&ctx.config.paths.base_dir)?;
        let last_seed = SeedStore::new(ctx.config.paths.seed_file()).load();
        let patched = patcher::patch(
            &template,
            &ctx.character.nodes,
            options,
            &ctx.permissions,
            last_seed,
        )?;
        let key = Self::session_key(&ctx.permissions.username, session);
        Self::temp_store(&ctx.config).save(&key, &ctx.character.workflow_file, &patched)
    }

    /// Applies the advanced options to a fresh copy of the character's template,
    /// and keeps the result as this session's workflow for the next generation.
    pub async fn update_options(
        &self,
        user: &str,
        session: &str,
        character: &str,
        options: &GenerationOptions,
    ) -> Result<PathBuf> {
        let ctx = self.context(user, character).await?;
        Self::patch_and_store(&ctx, session, options)
    }

    /// Drops the session's workflow, so the next generation starts from the template again.
    pub async fn reset_options(&self, user: &str, session: &str, character: &str) -> Result<bool> {
        let ctx = self.context(user, character).await?;
        Self::temp_store(&ctx.config).clear(&Self::session_key(user, session), &ctx.character.workflow_file)
    }

    /// Generates images of `character`. With `options`, they're applied first, as by `update_options`.
    pub async fn generate(
        &self,
        user: &str,
        session: &str,
        character: &str,
        mode: &PromptMode,
        options: Option<&GenerationOptions>,
    ) -> Result<JobOutcome> {
        let ctx = self.context(user, character).await?;
        if let Some(options) = options {
            Self::patch_and_store(&ctx, session, options)?;
        }

        let text = prompt::resolve(mode, &ctx.character, self.llm.as_ref())
            .await
            .context("failed to get a prompt")?;
        self.run(&ctx, user, session, &text).await
    }

    /// Runs the user's latest prompt again, with the session's current workflow.
    pub async fn regenerate(&self, user: &str, session: &str, character: &str) -> Result<JobOutcome> {
        let ctx = self.context(user, character).await?;
        let (latest_prompt, _) = self.db.latest(user).await?;
        let Some(text) = latest_prompt.filter(|p| !p.trim().is_empty()) else {
            bail!("there is no previous prompt to regenerate");
        };
        self.run(&ctx, user, session, &text).await
    }

    async fn run(&self, ctx: &RequestContext, user: &str, session: &str, text: &str) -> Result<JobOutcome> {
        let paths = &ctx.config.paths;
        let template = ctx.character.load_template(&paths.base_dir)?;
        let key = Self::session_key(user, session);
        let mut workflow = match Self::temp_store(&ctx.config).load(&key, &ctx.character.workflow_file) {
            Some(workflow) => {
                info!("Using the session's workflow for {}", ctx.character.name);
                // Grants may have changed since the options were applied.
                patcher::check_patched(&workflow, &template, &ctx.character.nodes, &ctx.permissions)?;
                workflow
            }
            None => template,
        };
        patcher::set_prompt(&mut workflow, &ctx.character.nodes, text)?;
        debug!("LoRAs: {:?}", patcher::lora_entries(&workflow, &ctx.character.nodes));
        workflow.validate().context("refusing to submit a broken workflow")?;

        let dispatcher = Dispatcher::new(
            self.backend.clone(),
            ImageArchive::from_config(paths),
            ctx.config.backend.timeout(),
        );
        let outcome = dispatcher
            .run(Job {
                user,
                character: &ctx.character,
                prompt: text,
                workflow: &workflow,
            })
            .await?;

        if let Some(seed) = outcome.seed {
            if let Err(e) = SeedStore::new(paths.seed_file()).save(seed) {
                warn!("Failed to save the last seed: {:#}", e);
            }
        }
        self.db.record_latest(user, &outcome.prompt, &outcome.latest).await?;
        Ok(outcome)
    }

    /// The last persisted seed, or -1.
    pub async fn last_seed(&self) -> i64 {
        let config = self.config.snapshot().await;
        SeedStore::new(config.paths.seed_file())
            .load()
            .unwrap_or(patcher::RANDOM_SEED)
    }

    /// The character's unmodified template.
    pub async fn default_workflow(&self, user: &str, character: &str) -> Result<Workflow> {
        let ctx = self.context(user, character).await?;
        ctx.character.load_template(&ctx.config.paths.base_dir)
    }

    pub async fn models(&self) -> ModelCatalog {
        let config = self.config.snapshot().await;
        ModelCatalog::scan(&config.paths.models_dir())
    }

    pub async fn characters(&self) -> Result<Vec<String>> {
        let config = self.config.snapshot().await;
        Ok(CharacterBook::load(&config.paths.characters())?.names().cloned().collect())
    }
}
