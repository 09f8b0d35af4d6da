use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use contacts_core::operation::OperationDescriptor;
use contacts_core::{Account, AttributeKind, ContactId, ContextKind, RawContactId};
use contacts_provider::handlers::DataPatch;
use contacts_provider::{
    ApplyResult, ContactsProvider, LookupOutcome, NewRawContact, ProviderConfig, QuerySignature,
};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "contactsctl")]
#[command(about = "Contacts store maintenance CLI", long_about = None)]
struct Cli {
    /// TOML config file; falls back to CONTACTS_CONFIG_PATH.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Which store to operate on.
    #[arg(long, global = true, default_value = "main")]
    context: ContextKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate both stores
    Init,
    /// Insert a raw contact
    AddRaw {
        #[arg(long)]
        account_type: Option<String>,
        #[arg(long)]
        account_name: Option<String>,
        #[arg(long)]
        source_id: Option<String>,
        #[arg(long)]
        sync_adapter: bool,
    },
    /// Insert a data row, e.g. `add-data 4 phone --column 1=555-0100 --column 2=2`
    AddData {
        raw_contact_id: i64,
        kind: String,
        #[arg(long = "column", value_parser = parse_column)]
        columns: Vec<(usize, String)>,
        #[arg(long)]
        primary: bool,
        #[arg(long)]
        super_primary: bool,
    },
    /// Resolve a lookup key to a contact id
    Resolve { key: String },
    /// Print the current lookup key of a contact
    LookupKey { contact_id: i64 },
    /// Print fast-scroll index buckets
    Index {
        #[arg(long)]
        selection: Option<String>,
        #[arg(long = "arg")]
        selection_args: Vec<String>,
        #[arg(long)]
        alternative: bool,
    },
    /// Apply a JSON operation descriptor, or an array of them, in one transaction
    Apply {
        /// Path to the JSON file; `-` reads stdin.
        path: PathBuf,
    },
}

fn parse_column(input: &str) -> Result<(usize, String), String> {
    let (column, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected N=VALUE, got {input:?}"))?;
    let column = column
        .trim()
        .trim_start_matches("data")
        .parse::<usize>()
        .map_err(|err| format!("bad column {column:?}: {err}"))?;
    Ok((column, value.to_string()))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().or_else(ProviderConfig::config_path_from_env);
    let config = ProviderConfig::load(config_path.as_deref()).context("Failed to load config")?;
    init_logging(&config.log_level);

    let provider = ContactsProvider::open(config).context("Failed to open contacts stores")?;
    provider
        .wait_until_ready()
        .context("Contacts stores failed to initialize")?;
    let context = provider.context(cli.context);

    match cli.command {
        Commands::Init => {
            for kind in [ContextKind::Main, ContextKind::Profile] {
                let version = provider.context(kind).read(|store| Ok(store.schema_version()?))?;
                println!(
                    "{kind}: {} (schema {version})",
                    provider.config().db_path(kind).display()
                );
            }
        }
        Commands::AddRaw {
            account_type,
            account_name,
            source_id,
            sync_adapter,
        } => {
            let account = match (account_type, account_name) {
                (Some(account_type), Some(account_name)) => Some(Account::new(account_type, account_name)),
                (None, None) => None,
                _ => bail!("--account-type and --account-name go together"),
            };
            let raw_contact_id = context.transaction(|session| {
                session.set_caller_is_sync_adapter(sync_adapter);
                session.insert_raw_contact(NewRawContact {
                    account,
                    source_id,
                    ..NewRawContact::default()
                })
            })?;
            println!("{raw_contact_id}");
        }
        Commands::AddData {
            raw_contact_id,
            kind,
            columns,
            primary,
            super_primary,
        } => {
            let kind = AttributeKind::parse(&kind);
            let mut patch = DataPatch::new();
            for (column, value) in columns {
                patch = patch.column(column, value);
            }
            if primary {
                patch = patch.primary(true);
            }
            if super_primary {
                patch = patch.super_primary(true);
            }
            let data_id = context.transaction(|session| {
                session.insert_data(RawContactId(raw_contact_id), &kind, &patch)
            })?;
            println!("{data_id}");
        }
        Commands::Resolve { key } => match context.resolve_lookup_key(&key)? {
            LookupOutcome::Found(contact_id) => println!("{contact_id}"),
            LookupOutcome::NotFound => {
                println!("not found");
                std::process::exit(1);
            }
        },
        Commands::LookupKey { contact_id } => {
            let key = context.transaction(|session| session.lookup_key_for_contact(ContactId(contact_id)))?;
            println!("{key}");
        }
        Commands::Index {
            selection,
            selection_args,
            alternative,
        } => {
            let mut signature = QuerySignature::new("contacts");
            if let Some(selection) = selection {
                signature = signature.with_selection(selection, selection_args);
            }
            if alternative {
                signature = signature.with_sort_order("sort_key_alt");
            }
            let buckets = context.fast_index(&signature)?;
            for (label, count) in buckets.entries() {
                println!("{label}\t{count}");
            }
        }
        Commands::Apply { path } => {
            let content = if path.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
            } else {
                fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?
            };
            let value: serde_json::Value =
                serde_json::from_str(&content).context("Failed to parse operations")?;
            let operations: Vec<OperationDescriptor> = if value.is_array() {
                serde_json::from_value(value)
            } else {
                serde_json::from_value(value).map(|operation| vec![operation])
            }
            .context("Failed to parse operations")?;

            let results = context.transaction(|session| {
                operations
                    .iter()
                    .map(|operation| session.apply(operation))
                    .collect::<Result<Vec<_>, _>>()
            })?;
            info!(event = "operations_applied", count = results.len());
            for result in results {
                match result {
                    ApplyResult::Inserted(id) => println!("inserted {id}"),
                    ApplyResult::Affected(count) => println!("affected {count}"),
                }
            }
        }
    }

    Ok(())
}
