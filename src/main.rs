#![recursion_limit = "256"]

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

mod chat;
mod config;
mod entity;
mod ingest;
mod jira;
mod llm;
mod metrics;
mod pipeline;
mod report;
mod server;
mod store;
mod tips;

use config::{Cli, Command};
use pipeline::{FileJobOptions, Scorer, StoreJobOptions, FILE_MAX_OUTPUT_TOKENS, STORE_MAX_OUTPUT_TOKENS};
use tips::GroupingOptions;

async fn open_store(path: &std::path::Path) -> anyhow::Result<store::Store> {
    info!("Initializing store at {}", path.display());
    let store = store::Store::new(path).await?;
    store.init().await?;
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        info!("No .env file found or failed to load: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        Command::Prepare {
            inputs,
            output,
            append,
            sample,
            max_tokens,
            no_token_cap,
        } => {
            let summary = ingest::prepare_exports(&ingest::PrepareOptions {
                inputs,
                output,
                append,
                sample_issues: sample,
                max_merged_tokens: (!no_token_cap).then_some(max_tokens),
            })?;
            for (file, count) in &summary.per_file_counts {
                info!("{}: {} rows", file, count);
            }
            info!(
                "{} comment columns, {} contact reason columns",
                summary.comment_columns, summary.contact_reason_columns
            );
        }

        Command::Score {
            input,
            output,
            limit,
            resume,
            generate_payloads,
            benchmark_models,
            llm,
        } => {
            anyhow::ensure!(input.exists(), "input file not found: {}", input.display());
            let settings = llm.settings(FILE_MAX_OUTPUT_TOKENS);
            // Payload generation replaces the model call.
            let client = if generate_payloads.is_some() {
                None
            } else {
                llm.client()
            };
            let models = if benchmark_models.is_empty() {
                vec![settings.model.clone()]
            } else {
                benchmark_models
            };
            let options = FileJobOptions {
                input,
                output: output.clone().unwrap_or_default(),
                limit,
                resume,
                payload_dir: generate_payloads.clone(),
            };

            let summaries =
                pipeline::run_benchmark(&settings, client, &models, output.as_deref(), &options)
                    .await?;
            for summary in &summaries {
                info!("[summary] {}", summary);
            }
            if let Some(dir) = generate_payloads {
                info!("Request payloads written to {}", dir.display());
            }
        }

        Command::Load { input, db } => {
            let store = open_store(&db.db).await?;
            let saved = pipeline::load_jsonl_into_store(&store, &input).await?;
            info!("Loaded {} prepared conversations into {}", saved, db.db.display());
        }

        Command::Pull {
            start_date,
            end_date,
            batch_size,
            max_issues,
            jql,
            force_full_refresh,
            dry_run,
            count_only,
            jira: jira_args,
            db,
        } => {
            let client = jira_args
                .client()?
                .context("JIRA_BASE_URL, JIRA_EMAIL and JIRA_API_KEY must all be set")?;
            let store = open_store(&db.db).await?;
            let options = jira::PullOptions {
                start_date,
                end_date,
                batch_size,
                max_issues,
                jql_override: jql,
                force_full_refresh,
                dry_run,
                count_only,
                ..jira_args.pull_options()
            };
            let summary = jira::pull_into_store(&client, &store, &options).await?;
            for failure in &summary.failures {
                error!("{}", failure);
            }
            info!("{}", summary);
        }

        Command::GroupTips {
            hours,
            reference_time,
            model,
            max_tokens,
            no_persist,
            dry_run,
            api,
            db,
        } => {
            let store = open_store(&db.db).await?;
            let client = if dry_run { None } else { api.client() };
            let options = GroupingOptions {
                model,
                max_output_tokens: max_tokens,
                hours,
                reference_time,
                persist: !no_persist,
                dry_run,
            };
            let summary = tips::run_tip_grouping(&store, client.as_deref(), &options).await?;
            info!("{}", summary);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Process {
            limit,
            dry_run,
            llm,
            db,
        } => {
            let store = open_store(&db.db).await?;
            let scorer = Scorer::new(llm.settings(STORE_MAX_OUTPUT_TOKENS), llm.client());
            let summary =
                pipeline::run_store_job(&store, &scorer, &StoreJobOptions { limit, dry_run }).await?;
            info!("{}", summary);
        }

        Command::Serve {
            bind,
            ingest_inputs,
            grouping_model,
            llm,
            jira: jira_args,
            db,
        } => {
            let store = open_store(&db.db).await?;
            let scorer = Scorer::new(llm.settings(STORE_MAX_OUTPUT_TOKENS), llm.client());
            let mut server = server::TriggerServer::new(store, scorer, ingest_inputs)
                .with_grouping(
                    llm.api.client(),
                    GroupingOptions {
                        model: grouping_model,
                        ..Default::default()
                    },
                );
            if let Some(jira_client) = jira_args.client()? {
                server = server.with_jira(jira_client, jira_args.pull_options());
            }
            let app = server.router();

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Failed to bind {}", bind))?;
            info!("Starting trigger server on {}", bind);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                res = axum::serve(listener, app) => {
                    if let Err(e) = res {
                        error!("Server stopped with error: {}", e);
                    }
                }
            }
        }
    }

    Ok(())
}
