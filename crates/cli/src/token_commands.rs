use std::time::Duration;

use {anyhow::Result, clap::Subcommand};

use {
    duet_config::DuetConfig,
    duet_gateway::{SessionAuthenticator, TokenIssuer, rooms::validate_user_id},
};

#[derive(Subcommand)]
pub enum TokenAction {
    /// Mint a session token signed with the configured secret.
    Issue {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        email: Option<String>,
        /// Lifetime in seconds.
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: u64,
    },
    /// Check a token the way the gateway handshake does.
    Verify { token: String },
}

pub fn handle_token(action: TokenAction, config: &DuetConfig) -> Result<()> {
    match action {
        TokenAction::Issue {
            user_id,
            email,
            ttl_secs,
        } => {
            validate_user_id(&user_id)?;
            let issuer = TokenIssuer::from_config(&config.auth)?;
            let token = issuer.issue(&user_id, email.as_deref(), Duration::from_secs(ttl_secs))?;
            println!("{token}");
            Ok(())
        },
        TokenAction::Verify { token } => {
            let authenticator = SessionAuthenticator::from_config(&config.auth)?;
            match authenticator.authenticate(Some(&token)) {
                Ok(identity) => {
                    println!("valid: user {}", identity.user_id);
                    if let Some(email) = identity.email {
                        println!("email: {email}");
                    }
                    Ok(())
                },
                Err(e) => anyhow::bail!("{e}"),
            }
        },
    }
}
