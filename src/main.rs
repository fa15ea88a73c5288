use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use studyhall::auth::{SqliteUserRepository, UserRepository};
use studyhall::{IdentityConfig, IdentityService, Permission, Registration, Role};
use tracing_subscriber::{fmt, EnvFilter};

/// StudyHall identity administration.
#[derive(Parser, Debug)]
#[command(name = "studyhall", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account
    Register {
        username: String,
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        full_name: Option<String>,
        /// student, instructor or administrator
        #[arg(long, default_value = "student")]
        role: String,
    },
    /// Log in by username or email and print the session token
    Login {
        identifier: String,
        #[arg(long)]
        password: String,
    },
    Logout {
        token: String,
    },
    /// Show the user behind a session
    Whoami {
        token: String,
    },
    /// Check whether a session holds a permission
    Check {
        token: String,
        permission: String,
    },
    ChangePassword {
        user_id: String,
        #[arg(long)]
        current: String,
        #[arg(long)]
        new: String,
    },
    /// Issue a password-reset token for an email address
    ResetRequest {
        email: String,
    },
    /// Set a new password with a reset token
    Reset {
        token: String,
        #[arg(long)]
        password: String,
    },
    /// Replace a user's password with a generated one
    TempPassword {
        user_id: String,
    },
    /// Force (or clear) a password change at next login
    RequireChange {
        user_id: String,
        #[arg(long)]
        clear: bool,
    },
    /// Drop expired sessions and reset tokens
    Sweep,
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the JSON schema of the config file
    Schema,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = IdentityConfig::load(cli.config.as_deref())?;

    if let Command::Config(sub) = &cli.command {
        match sub {
            ConfigCommand::Show => print!("{}", toml::to_string_pretty(&config)?),
            ConfigCommand::Schema => println!("{}", IdentityConfig::json_schema()?),
        }
        return Ok(());
    }

    let service = build_service(&config)?;
    run(&service, cli.command)
}

fn build_service(config: &IdentityConfig) -> Result<IdentityService> {
    let Some(users_path) = config.users.resolved_database_path() else {
        bail!("No user database path configured and no platform data directory found");
    };
    let users: Arc<dyn UserRepository> = Arc::new(
        SqliteUserRepository::open(&users_path)
            .with_context(|| format!("Failed to open user database {}", users_path.display()))?,
    );
    let service = IdentityService::from_config(config, users)?;
    tracing::debug!(
        backend = service.sessions().backend_kind().as_str(),
        "Identity service ready"
    );
    Ok(service)
}

fn run(service: &IdentityService, command: Command) -> Result<()> {
    let output = match command {
        Command::Register {
            username,
            email,
            password,
            full_name,
            role,
        } => {
            let role = match Role::from_str_lossy(&role) {
                Role::Unknown => bail!("Unknown role '{role}'"),
                known => known,
            };
            let mut registration = Registration::new(username, email, password).role(role);
            if let Some(name) = full_name {
                registration = registration.full_name(name);
            }
            json!({ "user_id": service.register(registration)? })
        }
        Command::Login {
            identifier,
            password,
        } => serde_json::to_value(service.login(&identifier, &password)?)?,
        Command::Logout { token } => json!({ "closed": service.logout(&token)? }),
        Command::Whoami { token } => match service.current_user(&token)? {
            Some(profile) => serde_json::to_value(profile)?,
            None => bail!("No active session for that token"),
        },
        Command::Check { token, permission } => {
            let Some(permission) = Permission::parse(&permission) else {
                bail!("Unknown permission '{permission}'");
            };
            json!({
                "permission": permission.as_str(),
                "granted": service.check_permission(&token, permission),
            })
        }
        Command::ChangePassword {
            user_id,
            current,
            new,
        } => {
            service.change_password(&user_id, &current, &new)?;
            json!({ "changed": true })
        }
        Command::ResetRequest { email } => {
            // Delivery is out of band; the operator relays the token.
            json!({ "accepted": true, "token": service.request_password_reset(&email)? })
        }
        Command::Reset { token, password } => {
            service.reset_password(&token, &password)?;
            json!({ "reset": true })
        }
        Command::TempPassword { user_id } => {
            json!({ "temporary_password": service.generate_temporary_password(&user_id)? })
        }
        Command::RequireChange { user_id, clear } => {
            service.require_password_change_on_next_login(&user_id, !clear)?;
            json!({ "must_change_password": !clear })
        }
        Command::Sweep => json!({ "removed": service.sweep_expired()? }),
        Command::Config(_) => return Ok(()),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
