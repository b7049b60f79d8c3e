//! Implementación Postgres (Diesel) del log de estados.
//!
//! Paridad con `InMemoryStateLogStore`:
//! - `saga_machine_inst` guarda la cabecera; `is_running` se recalcula en cada
//!   escritura y alimenta el índice único parcial de business keys.
//! - `saga_state_inst` guarda un registro por estado (o por intento en modo
//!   state-as-new), único por `(machine_inst_id, seq)`.
//! - Lecturas devuelven la instancia con sus registros ordenados por `seq`.
//! - Errores transitorios (pool, conflicto de serialización) se reintentan con
//!   backoff corto.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::ConnectionManager;
use log::{debug, info, warn};
use serde_json::Value;

use saga_core::{ErrorRecord, ExecutionStatus, ScopeSegment, StateInstance, StateLogStore, StateMachineInstance, StateType, StoreError};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::{saga_machine_inst, saga_state_inst};

/// Índice único parcial sobre `(tenant_id, business_key)` de instancias no terminales.
pub const BUSINESS_KEY_INDEX: &str = "saga_machine_inst_bk_running";

/// Pool r2d2 de conexiones Postgres. Al construirlo se aplican las migraciones pendientes.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub type PgPooledConnection = r2d2::PooledConnection<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Permite inyectar un pool real o uno de test sin acoplar el store a r2d2.
/// Debe devolver `PersistenceError::TransientIo` si no hay conexión.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError>;
}

pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<PgPooledConnection, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = saga_machine_inst, treat_none_as_null = true)]
struct MachineRow<'a> {
    id: &'a str,
    machine_name: &'a str,
    tenant_id: &'a str,
    parent_id: Option<&'a str>,
    definition_hash: &'a str,
    business_key: Option<&'a str>,
    status: &'static str,
    compensation_status: Option<&'static str>,
    is_running: bool,
    start_params: &'a Value,
    end_params: Option<&'a Value>,
    error: Option<Value>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl<'a> MachineRow<'a> {
    fn from_model(i: &'a StateMachineInstance) -> Result<Self, PersistenceError> {
        Ok(Self { id: &i.id,
                  machine_name: &i.machine_name,
                  tenant_id: &i.tenant_id,
                  parent_id: i.parent_id.as_deref(),
                  definition_hash: &i.definition_hash,
                  business_key: i.business_key.as_deref(),
                  status: i.status.code(),
                  compensation_status: i.compensation_status.map(|c| c.code()),
                  is_running: i.is_running(),
                  start_params: &i.start_params,
                  end_params: i.end_params.as_ref(),
                  error: i.error.as_ref().map(serde_json::to_value).transpose()?,
                  started_at: i.started_at,
                  updated_at: i.updated_at,
                  ended_at: i.ended_at })
    }
}

#[derive(Insertable, AsChangeset, Debug)]
#[diesel(table_name = saga_state_inst, treat_none_as_null = true)]
struct StateRow<'a> {
    id: &'a str,
    machine_inst_id: &'a str,
    seq: i64,
    name: &'a str,
    state_type: &'static str,
    scope: Value,
    status: &'static str,
    business_key: Option<&'a str>,
    input: &'a Value,
    output: Option<&'a Value>,
    error: Option<Value>,
    for_update: bool,
    is_for_compensation: bool,
    compensated_state_id: Option<&'a str>,
    retried_state_id: Option<&'a str>,
    sub_instance_id: Option<&'a str>,
    attempts: i32,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    end_seq: Option<i64>,
}

impl<'a> StateRow<'a> {
    fn from_model(s: &'a StateInstance) -> Result<Self, PersistenceError> {
        Ok(Self { id: &s.id,
                  machine_inst_id: &s.machine_instance_id,
                  seq: s.seq as i64,
                  name: &s.name,
                  state_type: s.state_type.code(),
                  scope: serde_json::to_value(&s.scope)?,
                  status: s.status.code(),
                  business_key: s.business_key.as_deref(),
                  input: &s.input,
                  output: s.output.as_ref(),
                  error: s.error.as_ref().map(serde_json::to_value).transpose()?,
                  for_update: s.for_update,
                  is_for_compensation: s.is_for_compensation,
                  compensated_state_id: s.compensated_state_id.as_deref(),
                  retried_state_id: s.retried_state_id.as_deref(),
                  sub_instance_id: s.sub_instance_id.as_deref(),
                  attempts: s.attempts as i32,
                  started_at: s.started_at,
                  updated_at: s.updated_at,
                  ended_at: s.ended_at,
                  end_seq: s.end_seq.map(|n| n as i64) })
    }
}

/// Fila leída de `saga_machine_inst` (orden de columnas del esquema).
#[derive(Queryable, Debug)]
pub struct MachineRecord {
    pub id: String,
    pub machine_name: String,
    pub tenant_id: String,
    pub parent_id: Option<String>,
    pub definition_hash: String,
    pub business_key: Option<String>,
    pub status: String,
    pub compensation_status: Option<String>,
    pub is_running: bool,
    pub start_params: Value,
    pub end_params: Option<Value>,
    pub error: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Fila leída de `saga_state_inst` (orden de columnas del esquema).
#[derive(Queryable, Debug)]
pub struct StateRecord {
    pub id: String,
    pub machine_inst_id: String,
    pub seq: i64,
    pub name: String,
    pub state_type: String,
    pub scope: Value,
    pub status: String,
    pub business_key: Option<String>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub for_update: bool,
    pub is_for_compensation: bool,
    pub compensated_state_id: Option<String>,
    pub retried_state_id: Option<String>,
    pub sub_instance_id: Option<String>,
    pub attempts: i32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_seq: Option<i64>,
}

fn decode_status(code: &str) -> Result<ExecutionStatus, PersistenceError> {
    ExecutionStatus::from_code(code).ok_or_else(|| PersistenceError::Decode(format!("unknown status code '{code}'")))
}

fn decode_error(value: Option<Value>) -> Result<Option<ErrorRecord>, PersistenceError> {
    Ok(value.map(serde_json::from_value).transpose()?)
}

impl MachineRecord {
    pub fn into_model(self, states: Vec<StateInstance>) -> Result<StateMachineInstance, PersistenceError> {
        Ok(StateMachineInstance { status: decode_status(&self.status)?,
                                  compensation_status: self.compensation_status.as_deref().map(decode_status).transpose()?,
                                  error: decode_error(self.error)?,
                                  id: self.id,
                                  machine_name: self.machine_name,
                                  tenant_id: self.tenant_id,
                                  parent_id: self.parent_id,
                                  definition_hash: self.definition_hash,
                                  business_key: self.business_key,
                                  start_params: self.start_params,
                                  end_params: self.end_params,
                                  started_at: self.started_at,
                                  updated_at: self.updated_at,
                                  ended_at: self.ended_at,
                                  states })
    }
}

impl StateRecord {
    pub fn into_model(self) -> Result<StateInstance, PersistenceError> {
        let state_type = StateType::from_code(&self.state_type).ok_or_else(|| {
                                                                    PersistenceError::Decode(format!("unknown state type '{}'", self.state_type))
                                                                })?;
        let scope: Vec<ScopeSegment> = serde_json::from_value(self.scope)?;
        Ok(StateInstance { status: decode_status(&self.status)?,
                           error: decode_error(self.error)?,
                           id: self.id,
                           machine_instance_id: self.machine_inst_id,
                           seq: self.seq as u64,
                           name: self.name,
                           state_type,
                           scope,
                           business_key: self.business_key,
                           input: self.input,
                           output: self.output,
                           for_update: self.for_update,
                           is_for_compensation: self.is_for_compensation,
                           compensated_state_id: self.compensated_state_id,
                           retried_state_id: self.retried_state_id,
                           sub_instance_id: self.sub_instance_id,
                           attempts: self.attempts.max(0) as u32,
                           started_at: self.started_at,
                           updated_at: self.updated_at,
                           ended_at: self.ended_at,
                           end_seq: self.end_seq.map(|n| n.max(0) as u64) })
    }
}

/// Determina si un error es transitorio (recomendado reintentar con backoff).
///
/// Además de las variantes explícitas, hace best-effort sobre el texto de
/// errores que el driver no clasifica (deadlocks, desconexiones).
fn is_retryable(e: &PersistenceError) -> bool {
    match e {
        PersistenceError::SerializationConflict => true,
        PersistenceError::TransientIo(_) => true,
        PersistenceError::Unknown(msg) => {
            let m = msg.to_lowercase();
            m.contains("deadlock detected")
            || m.contains("could not serialize access due to concurrent update")
            || m.contains("terminating connection due to administrator command")
            || m.contains("connection closed")
            || m.contains("connection refused")
            || m.contains("timeout")
        }
        _ => false,
    }
}

/// Retry simple con backoff lineal (hasta 3 reintentos: 15ms, 30ms, 45ms).
fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_retryable(&e) && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

/// Carga los registros de estado de las cabeceras dadas y arma las instancias.
fn hydrate(conn: &mut PgConnection, headers: Vec<MachineRecord>) -> Result<Vec<StateMachineInstance>, PersistenceError> {
    if headers.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<&str> = headers.iter().map(|h| h.id.as_str()).collect();
    let rows: Vec<StateRecord> = saga_state_inst::table.filter(saga_state_inst::machine_inst_id.eq_any(ids))
                                                       .order((saga_state_inst::machine_inst_id.asc(), saga_state_inst::seq.asc()))
                                                       .load(conn)?;
    let mut by_instance: HashMap<String, Vec<StateInstance>> = HashMap::new();
    for row in rows {
        let state = row.into_model()?;
        by_instance.entry(state.machine_instance_id.clone()).or_default().push(state);
    }
    headers.into_iter()
           .map(|h| {
               let states = by_instance.remove(&h.id).unwrap_or_default();
               h.into_model(states)
           })
           .collect()
}

/// Log de estados sobre Postgres.
pub struct PgStateLogStore<P: ConnectionProvider> {
    provider: P,
}

impl<P: ConnectionProvider> PgStateLogStore<P> {
    pub fn new(provider: P) -> Self { Self { provider } }

    /// Lectura consistente (transacción read-only) de varias cabeceras con sus estados.
    fn read<F>(&self, query: F) -> Result<Vec<StateMachineInstance>, PersistenceError>
        where F: Fn(&mut PgConnection) -> QueryResult<Vec<MachineRecord>>
    {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            conn.build_transaction().read_only().run(|tx| {
                                                    let headers = query(tx)?;
                                                    hydrate(tx, headers)
                                                })
        })
    }

    /// Instancia no terminal que retiene la business key, si sigue existiendo.
    fn business_key_holder(&self, tenant_id: &str, business_key: &str) -> Result<Option<String>, PersistenceError> {
        with_retry(|| {
            let mut conn = self.provider.connection()?;
            saga_machine_inst::table.filter(saga_machine_inst::tenant_id.eq(tenant_id))
                                    .filter(saga_machine_inst::business_key.eq(business_key))
                                    .filter(saga_machine_inst::is_running.eq(true))
                                    .select(saga_machine_inst::id)
                                    .first::<String>(&mut conn)
                                    .optional()
                                    .map_err(PersistenceError::from)
        })
    }

    /// Borra una instancia, sus sub-máquinas y todos sus registros de estado.
    pub fn purge_instance(&self, id: &str) -> Result<usize, PersistenceError> {
        let child_pattern = format!("{id}:%");
        let deleted = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::delete(saga_machine_inst::table.filter(saga_machine_inst::id.eq(id)
                                                                                .or(saga_machine_inst::id.like(&child_pattern))))
                .execute(&mut conn)
                .map_err(PersistenceError::from)
        })?;
        info!("purge_instance instance_id={id} deleted={deleted}");
        Ok(deleted)
    }
}

impl<P: ConnectionProvider> StateLogStore for PgStateLogStore<P> {
    fn record_machine_started(&self, instance: &StateMachineInstance) -> Result<(), StoreError> {
        debug!("record_machine_started instance_id={} machine={}", instance.id, instance.machine_name);
        let row = MachineRow::from_model(instance)?;
        // Si quien retenía la clave termina entre el insert y la consulta, se reintenta una vez.
        for _ in 0..2 {
            let inserted = with_retry(|| {
                let mut conn = self.provider.connection()?;
                diesel::insert_into(saga_machine_inst::table).values(&row)
                                                            .execute(&mut conn)
                                                            .map_err(PersistenceError::from)
            });
            match inserted {
                Ok(_) => return Ok(()),
                Err(PersistenceError::UniqueViolation { constraint, .. }) if constraint == BUSINESS_KEY_INDEX => {
                    let (Some(key), tenant) = (instance.business_key.as_deref(), instance.tenant_id.as_str()) else {
                        return Err(StoreError::Backend(format!("{BUSINESS_KEY_INDEX} violated without business key")));
                    };
                    if let Some(holder) = self.business_key_holder(tenant, key)? {
                        return Err(StoreError::BusinessKeyConflict { business_key: key.to_string(),
                                                                     tenant_id: tenant.to_string(),
                                                                     instance_id: holder });
                    }
                    debug!("record_machine_started:holder_gone instance_id={} key={key}", instance.id);
                }
                Err(PersistenceError::UniqueViolation { .. }) => return Err(StoreError::Duplicate(instance.id.clone())),
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Unavailable(format!("business key of '{}' kept changing owner", instance.id)))
    }

    fn record_machine_updated(&self, instance: &StateMachineInstance) -> Result<(), StoreError> {
        let row = MachineRow::from_model(instance)?;
        let updated = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::update(saga_machine_inst::table.find(&instance.id)).set(&row)
                                                                       .execute(&mut conn)
                                                                       .map_err(PersistenceError::from)
        })?;
        if updated == 0 {
            return Err(StoreError::NotFound(instance.id.clone()));
        }
        debug!("record_machine_updated instance_id={} status={} compensation={:?}",
               instance.id,
               instance.status.code(),
               instance.compensation_status.map(|c| c.code()));
        Ok(())
    }

    fn record_state_started(&self, state: &StateInstance) -> Result<(), StoreError> {
        let row = StateRow::from_model(state)?;
        let inserted = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::insert_into(saga_state_inst::table).values(&row)
                                                      .execute(&mut conn)
                                                      .map_err(PersistenceError::from)
        });
        match inserted {
            Ok(_) => {
                debug!("record_state_started instance_id={} state={} seq={}",
                       state.machine_instance_id,
                       state.name,
                       state.seq);
                Ok(())
            }
            Err(PersistenceError::UniqueViolation { .. }) => Err(StoreError::Duplicate(format!("state {} seq {}", state.id, state.seq))),
            Err(e) => Err(e.into()),
        }
    }

    fn record_state_updated(&self, state: &StateInstance) -> Result<(), StoreError> {
        let row = StateRow::from_model(state)?;
        let updated = with_retry(|| {
            let mut conn = self.provider.connection()?;
            diesel::update(saga_state_inst::table.find(&state.id)).set(&row)
                                                                  .execute(&mut conn)
                                                                  .map_err(PersistenceError::from)
        })?;
        if updated == 0 {
            return Err(StoreError::NotFound(state.id.clone()));
        }
        debug!("record_state_updated instance_id={} state={} seq={} status={}",
               state.machine_instance_id,
               state.name,
               state.seq,
               state.status.code());
        Ok(())
    }

    fn get_instance(&self, id: &str) -> Result<Option<StateMachineInstance>, StoreError> {
        let found = self.read(|conn| saga_machine_inst::table.find(id).load::<MachineRecord>(conn))?;
        Ok(found.into_iter().next())
    }

    fn get_instance_by_business_key(&self, business_key: &str, tenant_id: &str) -> Result<Option<StateMachineInstance>, StoreError> {
        let found = self.read(|conn| {
                            saga_machine_inst::table.filter(saga_machine_inst::tenant_id.eq(tenant_id))
                                                    .filter(saga_machine_inst::business_key.eq(business_key))
                                                    .order(saga_machine_inst::started_at.desc())
                                                    .limit(1)
                                                    .load::<MachineRecord>(conn)
                        })?;
        Ok(found.into_iter().next())
    }

    fn query_instances_by_parent_id(&self, parent_id: &str) -> Result<Vec<StateMachineInstance>, StoreError> {
        Ok(self.read(|conn| {
                   saga_machine_inst::table.filter(saga_machine_inst::parent_id.eq(parent_id))
                                           .order(saga_machine_inst::started_at.asc())
                                           .load::<MachineRecord>(conn)
               })?)
    }

    fn list_recovery_candidates(&self, limit: usize) -> Result<Vec<StateMachineInstance>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(self.read(|conn| {
                   saga_machine_inst::table.filter(saga_machine_inst::parent_id.is_null())
                                           .filter(saga_machine_inst::is_running.eq(true))
                                           .order(saga_machine_inst::started_at.asc())
                                           .limit(limit)
                                           .load::<MachineRecord>(conn)
               })?)
    }
}

/// Construye un pool Postgres r2d2 a partir de URL y aplica las migraciones pendientes.
///
/// Si `min_size > max_size` se usa `min_size = max_size`. Los errores del
/// pool/manager se devuelven como `PersistenceError::TransientIo`.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("build_pool: min_size > max_size ({validated_min} > {validated_max}), ajustando min=max");
    }
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(validated_min.min(validated_max)))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee `DbConfig` y construye un pool ya migrado.
pub fn build_dev_pool_from_env() -> Result<PgPool, PersistenceError> {
    crate::config::init_dotenv();
    let cfg = crate::config::DbConfig::from_env()?;
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections)
}
