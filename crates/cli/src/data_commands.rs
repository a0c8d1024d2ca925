use {
    anyhow::{Context, Result},
    clap::Subcommand,
    sqlx::SqlitePool,
};

use {
    duet_config::DuetConfig,
    duet_gateway::rooms::validate_user_id,
    duet_store::{ConversationStore, SqliteConversationStore, SqliteUserDirectory, UserProfile},
};

#[derive(Subcommand)]
pub enum UsersAction {
    /// Add or replace a directory entry.
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Show one directory entry.
    Show { id: String },
}

async fn open(config: &DuetConfig) -> Result<SqlitePool> {
    let url = &config.storage.database_url;
    duet_store::connect(url, config.storage.max_connections)
        .await
        .with_context(|| format!("failed to open {url}"))
}

pub async fn handle_users(action: UsersAction, config: &DuetConfig) -> Result<()> {
    let directory = SqliteUserDirectory::new(open(config).await?);
    match action {
        UsersAction::Add { id, name, email } => {
            validate_user_id(&id)?;
            directory.upsert(&UserProfile { id, name, email }).await?;
            println!("ok");
        },
        UsersAction::Show { id } => match directory.get(&id).await? {
            Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
            None => anyhow::bail!("no such user: {id}"),
        },
    }
    Ok(())
}

pub async fn history(
    config: &DuetConfig,
    conversation_id: &str,
    page: u32,
    page_size: Option<u32>,
) -> Result<()> {
    let store = SqliteConversationStore::new(open(config).await?);
    if store.get_conversation(conversation_id).await?.is_none() {
        anyhow::bail!("no such conversation: {conversation_id}");
    }
    let page_size = config.history.page_size(page_size);
    let messages = store
        .load_history(conversation_id, page, page_size)
        .await?;
    for message in &messages {
        println!("{}", serde_json::to_string(message)?);
    }
    Ok(())
}

pub async fn chats(config: &DuetConfig, user_id: &str) -> Result<()> {
    let store = SqliteConversationStore::new(open(config).await?);
    let chats = store.list_for_user(user_id).await?;
    println!("{}", serde_json::to_string_pretty(&chats)?);
    Ok(())
}
