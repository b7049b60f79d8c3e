//! CLI operativa sobre el log Postgres.
//!
//! `saga show --instance <id> [--children]`
//! `saga find --business-key <k> [--tenant <t>]`
//! `saga pending [--limit n]`
//!
//! Imprime JSON por stdout. Códigos de salida: 0 ok, 4 no encontrado,
//! 5 error de backend.

use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::debug;
use saga_core::constants::DEFAULT_TENANT;
use saga_core::{StateLogStore, StateMachineInstance};
use saga_persistence::{build_dev_pool_from_env, PgStateLogStore, PoolProvider};
use serde::Serialize;
use serde_json::{json, Value};

const EXIT_NOT_FOUND: u8 = 4;
const EXIT_BACKEND: u8 = 5;

#[derive(Parser, Debug)]
#[command(name = "saga", about = "Inspección del log de sagas")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Instancia completa con sus registros de estado
    Show {
        #[arg(long)]
        instance: String,
        /// Incluye las sub-máquinas hijas
        #[arg(long)]
        children: bool,
    },
    /// Última instancia ligada a una business key
    Find {
        #[arg(long = "business-key")]
        business_key: String,
        #[arg(long, default_value = DEFAULT_TENANT)]
        tenant: String,
    },
    /// Instancias raíz no terminales, las más antiguas primero
    Pending {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

/// Fila resumida de `pending`.
#[derive(Debug, Serialize, PartialEq)]
struct PendingRow {
    id: String,
    machine: String,
    tenant: String,
    business_key: Option<String>,
    status: &'static str,
    compensation_status: Option<&'static str>,
    states: usize,
    started_at: DateTime<Utc>,
}

impl From<&StateMachineInstance> for PendingRow {
    fn from(i: &StateMachineInstance) -> Self {
        Self { id: i.id.clone(),
               machine: i.machine_name.clone(),
               tenant: i.tenant_id.clone(),
               business_key: i.business_key.clone(),
               status: i.status.code(),
               compensation_status: i.compensation_status.map(|c| c.code()),
               states: i.states.len(),
               started_at: i.started_at }
    }
}

enum Failure {
    NotFound(String),
    Backend(String),
}

fn to_json(value: impl Serialize) -> Result<Value, Failure> {
    serde_json::to_value(value).map_err(|e| Failure::Backend(format!("render: {e}")))
}

fn run(store: &dyn StateLogStore, command: Command) -> Result<Value, Failure> {
    let backend = |e: saga_core::StoreError| Failure::Backend(e.to_string());
    match command {
        Command::Show { instance, children } => {
            let found = store.get_instance(&instance)
                             .map_err(backend)?
                             .ok_or_else(|| Failure::NotFound(format!("instance '{instance}'")))?;
            if !children {
                return to_json(found);
            }
            let kids = store.query_instances_by_parent_id(&instance).map_err(backend)?;
            Ok(json!({ "instance": to_json(found)?, "children": to_json(kids)? }))
        }
        Command::Find { business_key, tenant } => {
            let found = store.get_instance_by_business_key(&business_key, &tenant)
                             .map_err(backend)?
                             .ok_or_else(|| Failure::NotFound(format!("business key '{business_key}' (tenant '{tenant}')")))?;
            to_json(found)
        }
        Command::Pending { limit } => {
            let pending = store.list_recovery_candidates(limit).map_err(backend)?;
            let rows: Vec<PendingRow> = pending.iter().map(PendingRow::from).collect();
            to_json(rows)
        }
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    pretty_env_logger::init();
    let cli = Cli::parse();
    debug!("saga-cli command={:?}", cli.command);

    let pool = match build_dev_pool_from_env() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[saga] pool error: {e}");
            return ExitCode::from(EXIT_BACKEND);
        }
    };
    let store = PgStateLogStore::new(PoolProvider { pool });
    match run(&store, cli.command) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("[saga] render error: {e}");
                ExitCode::from(EXIT_BACKEND)
            }
        },
        Err(Failure::NotFound(what)) => {
            eprintln!("[saga] no encontrado: {what}");
            ExitCode::from(EXIT_NOT_FOUND)
        }
        Err(Failure::Backend(msg)) => {
            eprintln!("[saga] error: {msg}");
            ExitCode::from(EXIT_BACKEND)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_core::{ExecutionStatus, InMemoryStateLogStore};

    #[test]
    fn parses_find_with_default_tenant() {
        let cli = Cli::try_parse_from(["saga", "find", "--business-key", "order-1"]).unwrap();
        assert_eq!(cli.command,
                   Command::Find { business_key: "order-1".into(),
                                   tenant: DEFAULT_TENANT.into() });
    }

    #[test]
    fn show_requires_instance() {
        assert!(Cli::try_parse_from(["saga", "show"]).is_err());
    }

    #[test]
    fn pending_lists_running_roots_only() {
        let store = InMemoryStateLogStore::new();
        let running = StateMachineInstance::new("a".into(), "orders", "default", "h", json!({}));
        let mut done = StateMachineInstance::new("b".into(), "orders", "default", "h", json!({}));
        done.status = ExecutionStatus::Succeeded;
        store.record_machine_started(&running).unwrap();
        store.record_machine_started(&done).unwrap();

        let out = run(&store, Command::Pending { limit: 10 }).ok().unwrap();
        let rows = out.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "a");
        assert_eq!(rows[0]["status"], "RU");
    }

    #[test]
    fn missing_instance_is_not_found() {
        let store = InMemoryStateLogStore::new();
        let out = run(&store,
                      Command::Show { instance: "nope".into(),
                                      children: false });
        assert!(matches!(out, Err(Failure::NotFound(_))));
    }
}
