//! CLI dispatch: build the API once, map each subcommand onto it, print JSON,
//! translate errors into exit codes.

use serde::Serialize;
use serde_json::json;

use crate::api::Api;
use crate::cli::{CacheCommand, Cli, Command, DraftsCommand, MarkState};
use crate::config::{self, Config};
use crate::errors::Result;
use crate::storage::Store;

pub async fn run(cli: Cli) -> i32 {
    match execute(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    config::ensure_dirs()?;
    let config = Config::load(cli.config.as_deref())?;
    let store = Store::open_default().await?;
    let api = Api::new(config, store);

    match cli.command {
        Command::Inbox {
            account,
            folder,
            limit,
            unread,
            fresh,
        } => {
            let result = api
                .list_inbox(account.as_deref(), &folder, limit, unread, fresh)
                .await?;
            print_json(&result)
        }

        Command::Read { conv_id, fresh } => {
            let result = api.resolve_conversation_id(&conv_id, fresh).await?;
            print_json(&result)
        }

        Command::Threads {
            account,
            folder,
            limit,
        } => {
            let conversations = api
                .thread_conversations(account.as_deref(), &folder, limit)
                .await?;
            print_json(&conversations)
        }

        Command::Search {
            query,
            account,
            folder,
            limit,
            advanced,
        } => {
            let result = if advanced {
                api.search_advanced(&query, account.as_deref(), folder.as_deref(), limit)
                    .await?
            } else {
                api.search(&query, account.as_deref(), limit).await?
            };
            print_json(&result)
        }

        Command::Sql { query, limit } => {
            let messages = api.search_sql(&query, &[], limit).await?;
            print_json(&messages)
        }

        Command::Compose {
            to,
            cc,
            subject,
            body,
            account,
        } => {
            let draft = api
                .create_draft(account.as_deref(), &to, &cc, &subject, &body, None, None)
                .await?;
            print_json(&draft)
        }

        Command::Reply {
            conv_id,
            body,
            all,
            account,
        } => {
            let draft = api
                .create_reply(account.as_deref(), &conv_id, &body, None, all)
                .await?;
            print_json(&draft)
        }

        Command::Drafts { command } => match command {
            DraftsCommand::List { account } => {
                let drafts = api.list_drafts(account.as_deref()).await?;
                print_json(&drafts)
            }
            DraftsCommand::Show { draft_id } => {
                let draft = api.get_draft(&draft_id).await?.ok_or_else(|| {
                    crate::errors::Error::NotFound(format!("draft not found: {draft_id}"))
                })?;
                print_json(&draft)
            }
            DraftsCommand::Delete { draft_id } => {
                let existed = api.delete_draft(&draft_id).await?;
                print_json(&json!({ "deleted": existed }))
            }
        },

        Command::Send {
            draft_id,
            confirm,
            token,
            account,
        } => {
            let response = api
                .send_draft(&draft_id, account.as_deref(), confirm, token.as_deref())
                .await?;
            print_json(&response)
        }

        Command::Mark {
            message_id,
            state,
            account,
        } => {
            match state {
                MarkState::Read => api.mark_read(&message_id, account.as_deref()).await?,
                MarkState::Unread => api.mark_unread(&message_id, account.as_deref()).await?,
                MarkState::Flag => api.flag_message(&message_id, account.as_deref()).await?,
                MarkState::Unflag => api.unflag_message(&message_id, account.as_deref()).await?,
            }
            print_json(&json!({ "ok": true }))
        }

        Command::Move {
            message_id,
            to_folder,
            from_folder,
            account,
        } => {
            api.move_message(&message_id, &to_folder, &from_folder, account.as_deref())
                .await?;
            print_json(&json!({ "ok": true }))
        }

        Command::Archive {
            message_id,
            account,
        } => {
            api.archive_message(&message_id, account.as_deref()).await?;
            print_json(&json!({ "ok": true }))
        }

        Command::Folders { account } => {
            let folders = api.list_folders(account.as_deref()).await?;
            print_json(&folders)
        }

        Command::Unread { account } => {
            let counts = api.get_unread_counts(account.as_deref()).await?;
            print_json(&counts)
        }

        Command::Attachments {
            message_id,
            download,
            dest,
        } => match download {
            Some(filename) => {
                let dest = dest.unwrap_or_else(|| std::path::PathBuf::from("."));
                let path = api.download_attachment(&message_id, &filename, &dest).await?;
                print_json(&json!({ "saved_to": path }))
            }
            None => {
                let attachments = api.list_attachments(&message_id).await?;
                print_json(&attachments)
            }
        },

        Command::Cache { command } => match command {
            CacheCommand::Stats => {
                let stats = api.get_cache_stats().await?;
                print_json(&stats)
            }
            CacheCommand::Clear => {
                api.clear_cache().await?;
                print_json(&json!({ "ok": true }))
            }
            CacheCommand::Refresh {
                account,
                folder,
                limit,
            } => {
                let fetched = api.refresh_cache(account.as_deref(), &folder, limit).await?;
                print_json(&json!({ "fetched": fetched }))
            }
        },

        Command::Status => {
            let status = api.get_status().await;
            print_json(&status)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| crate::errors::Error::InvalidInput(format!("serializing output: {e}")))?;
    println!("{rendered}");
    Ok(())
}
