use minijinja::Environment;
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::process::Command;

use crate::config::{Application, ConfigError, ConfigStore, Settings};
use crate::fleet::{NodeStatusCollector, dyno::DynoIdentity};
use crate::remote::ContainerRuntime;

pub const BUILD_PACKS: &[&str] = &[
    "clojure", "go", "java", "nodejs", "php", "python", "ruby", "scala",
];

const RESERVED_NAME: &str = "base";

const PRE_RECEIVE: &str = r#"#!/usr/bin/env bash
# Installed by fleetd for ${ app }.
set -e
while read -r oldrev newrev refname; do
    if [ "$refname" != "refs/heads/master" ]; then
        echo "Only pushes to master are deployed, rejecting $refname" >&2
        exit 1
    fi
done
"#;

const POST_RECEIVE: &str = r#"#!/usr/bin/env bash
# Installed by fleetd for ${ app }.
set -e
while read -r oldrev newrev refname; do
    exec ${ receive_command } "${ app }" "$newrev"
done
"#;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Application name cannot be 'base'")]
    ReservedName,
    #[error("Invalid application name `{0}`, names must match ^[a-z0-9]+([a-z0-9-]*[a-z0-9])?$")]
    InvalidName(String),
    #[error("unsupported buildpack requested: {requested}, valid choices are: {valid:?}")]
    UnsupportedBuildPack {
        requested: String,
        valid: Vec<&'static str>,
    },
    #[error("application with name `{0}` already exists")]
    AlreadyExists(String),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("`{command}` failed: {output}")]
    Command { command: String, output: String },
    #[error("Templating error: {0}")]
    Template(#[from] minijinja::Error),
}

pub fn validate_app_name(name: &str) -> Result<(), AppError> {
    if name.eq_ignore_ascii_case(RESERVED_NAME) {
        return Err(AppError::ReservedName);
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let valid = name.starts_with(allowed)
        && name.ends_with(allowed)
        && name.chars().all(|c| allowed(c) || c == '-');
    if !valid {
        return Err(AppError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn validate_build_pack(build_pack: &str) -> Result<(), AppError> {
    if !BUILD_PACKS.contains(&build_pack) {
        return Err(AppError::UnsupportedBuildPack {
            requested: build_pack.to_string(),
            valid: BUILD_PACKS.to_vec(),
        });
    }
    Ok(())
}

pub fn render_template(
    template_str: &str,
    vars: &impl Serialize,
) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()?;

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}

async fn run_local(program: &str, args: &[&str]) -> Result<(), AppError> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(AppError::Command {
            command: format!("{program} {}", args.join(" ")),
            output: text.trim().to_string(),
        });
    }
    Ok(())
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Creates, lists and destroys the git-deployable applications.
pub struct AppManager {
    store: ConfigStore,
}

impl AppManager {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    fn repository(settings: &Settings, name: &str) -> PathBuf {
        settings.git_directory.join(name)
    }

    pub async fn list(&self) -> Result<Vec<String>, AppError> {
        let config = self.store.load().await?;
        Ok(config.applications.into_iter().map(|app| app.name).collect())
    }

    pub async fn create(&self, name: &str, build_pack: &str) -> Result<Application, AppError> {
        let name = name.to_lowercase();
        validate_app_name(&name)?;

        let config = self.store.load().await?;
        if config.has_application(&name) {
            return Err(AppError::AlreadyExists(name));
        }
        validate_build_pack(build_pack)?;

        let repository = Self::repository(&config.settings, &name);
        let repository_str = repository.to_string_lossy().into_owned();
        run_local("git", &["init", "--bare", repository_str.as_str()]).await?;
        // HEAD on a branch that never exists keeps master deletable
        run_local(
            "git",
            &[
                "--git-dir",
                repository_str.as_str(),
                "symbolic-ref",
                "HEAD",
                "refs/heads/not-a-real-branch",
            ],
        )
        .await?;

        match &config.settings.receive_command {
            Some(receive_command) => {
                let vars = HashMap::from([
                    ("app", name.as_str()),
                    ("receive_command", receive_command.as_str()),
                ]);
                let hooks = [("pre-receive", PRE_RECEIVE), ("post-receive", POST_RECEIVE)];
                for (hook, template) in hooks {
                    let path = repository.join("hooks").join(hook);
                    tokio::fs::write(&path, render_template(template, &vars)?).await?;
                    make_executable(&path).await?;
                }
            }
            None => log::warn!("No receive_command configured, {name} gets no deploy hooks"),
        }

        let application = Application {
            name: name.clone(),
            build_pack: build_pack.to_string(),
            domains: Vec::new(),
            environment: HashMap::new(),
            processes: HashMap::new(),
            maintenance: false,
        };
        self.store
            .update(|cfg| {
                if cfg.has_application(&name) {
                    return Err(AppError::AlreadyExists(name.clone()));
                }
                cfg.applications.push(application.clone());
                Ok(())
            })
            .await?;

        log::info!("Application {name} created");
        Ok(application)
    }

    /// Removes the application, its repository and every one of its
    /// containers seen on the fleet. Returns the number of containers destroyed.
    pub async fn destroy(
        &self,
        name: &str,
        collector: &NodeStatusCollector,
        runtime: &dyn ContainerRuntime,
    ) -> Result<usize, AppError> {
        validate_app_name(name)?;

        let settings = self
            .store
            .update(|cfg| {
                let before = cfg.applications.len();
                cfg.applications.retain(|app| app.name != name);
                if cfg.applications.len() == before {
                    log::warn!("{name} is not a configured application, cleaning up leftovers");
                }
                Ok::<_, AppError>(cfg.settings.clone())
            })
            .await?;

        let repository = Self::repository(&settings, name);
        if tokio::fs::try_exists(&repository).await? {
            log::info!("Removing repository {repository:?}");
            tokio::fs::remove_dir_all(&repository).await?;
        }

        let mut destroyed = 0;
        for status in collector.collect().await? {
            if let Some(e) = &status.error {
                log::warn!("Containers of {name} on {} may survive: {e}", status.host);
                continue;
            }
            let doomed = status.containers.iter().filter(|container| {
                DynoIdentity::parse(container).is_ok_and(|dyno| dyno.app == name)
            });
            for container in doomed {
                match runtime.destroy(&status.host, container).await {
                    Ok(()) => destroyed += 1,
                    Err(e) => log::warn!("Failed to destroy {container} on {}: {e}", status.host),
                }
            }
        }

        log::info!("Application {name} destroyed");
        Ok(destroyed)
    }
}
