use std::fs;
use std::process;

use ocrbase_app::cli::{Cli, Commands, SchemaAddArgs, SchemaCommands, SchemaGenerateArgs};
use ocrbase_app::error::AppError;
use ocrbase_app::paths::AppPaths;
use ocrbase_app::pipeline::schema::SchemaDoc;
use ocrbase_app::services::{
    HttpLlmClient, LlmClient, LlmConfig, LmdbSchemaStore, SchemaStore, StructuredExtractor,
};
use ocrbase_app::{config, server};
use std::sync::Arc;
use tracing_subscriber::{filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => {
            let config = config::load()?;
            server::serve(config).await?;
        }
        Some(Commands::Worker(_)) => {
            let config = config::load()?;
            server::run_worker(config).await?;
        }
        Some(Commands::Schema(args)) => match args.command {
            SchemaCommands::Add(add) => run_schema_add(add)?,
            SchemaCommands::List => run_schema_list()?,
            SchemaCommands::Generate(generate) => run_schema_generate(generate).await?,
        },
        None => {
            Cli::print_help();
        }
    }

    Ok(())
}

fn open_schema_store() -> Result<LmdbSchemaStore, AppError> {
    let config = config::load()?;
    let paths = AppPaths::new(&config.storage.path)?;
    LmdbSchemaStore::open(&paths).map_err(AppError::SchemaStore)
}

fn run_schema_add(args: SchemaAddArgs) -> Result<(), AppError> {
    let raw = fs::read_to_string(&args.input).map_err(|source| AppError::Io {
        path: args.input.clone(),
        source,
    })?;
    let value = serde_json::from_str(&raw)?;
    let doc = SchemaDoc::from_value(&value)?;

    let store = open_schema_store()?;
    store.put(&doc).map_err(AppError::SchemaStore)?;
    println!("{}", doc.id);
    Ok(())
}

fn run_schema_list() -> Result<(), AppError> {
    let store = open_schema_store()?;
    for doc in store.list().map_err(AppError::SchemaStore)? {
        println!(
            "{}\t{}",
            doc.id,
            doc.name.as_deref().unwrap_or("(unnamed)")
        );
    }
    Ok(())
}

async fn run_schema_generate(args: SchemaGenerateArgs) -> Result<(), AppError> {
    let markdown = fs::read_to_string(&args.input).map_err(|source| AppError::Io {
        path: args.input.clone(),
        source,
    })?;

    let config = config::load()?;
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::from_env(
        LlmConfig::builder()
            .base_url(config.llm.base_url.clone())
            .model(config.llm.model.clone())
            .max_tokens(config.llm.max_tokens)
            .timeout_secs(config.llm.timeout_secs)
            .build(),
    )?);
    let extractor = StructuredExtractor::new(llm);

    let generated = extractor
        .generate_schema(&markdown, args.hints.as_deref())
        .await?;
    let doc = SchemaDoc::new(
        Some(generated.name.clone()),
        Some(generated.description.clone()),
        &generated.schema,
    );

    if args.register {
        let paths = AppPaths::new(&config.storage.path)?;
        let store = LmdbSchemaStore::open(&paths).map_err(AppError::SchemaStore)?;
        store.put(&doc).map_err(AppError::SchemaStore)?;
        eprintln!("registered as {}", doc.id);
    }

    let output = serde_json::json!({
        "id": doc.id,
        "name": generated.name,
        "description": generated.description,
        "schema": generated.schema,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) | Some(Commands::Worker(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        _ => match cli.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}
