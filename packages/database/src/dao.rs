//! Data access objects
//!
//! A [`Dao`] ties a [`Model`] to its table: the prefixed table name, the primary key, the table's
//! [`Field`]s matched to the model's attributes, and the hooks that run after each mutation.
//! [`dao`] hands out one shared instance per model type, initializing it on first use.

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, LazyLock, Mutex, PoisonError, RwLock},
};

use crate::{
    DatabaseError, DatabaseValue, ExecResult,
    connection::{self, Connection, Executor},
    query::{Action, Query, TableRef},
    record::{Record, RecordDescriptor, descriptor},
    schema::Field,
    transaction::Transaction,
};

const CREATED_AT: [&str; 2] = ["created_at", "createdAt"];
const UPDATED_AT: [&str; 2] = ["updated_at", "updatedAt"];

/// What a mutating query did, handed to hooks after it ran.
#[derive(Debug)]
pub struct Mutation<'a> {
    pub action: Action,
    pub table: &'a str,
    pub sql: &'a str,
    pub params: &'a [DatabaseValue],
    pub result: ExecResult,
}

pub type Hook = Box<dyn Fn(&Mutation<'_>) -> Result<(), DatabaseError> + Send + Sync>;

/// Callbacks run after inserts, updates and deletes, in registration order.
#[derive(Default)]
pub struct Hooks {
    on_insert: Vec<Hook>,
    on_update: Vec<Hook>,
    on_delete: Vec<Hook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_insert", &self.on_insert.len())
            .field("on_update", &self.on_update.len())
            .field("on_delete", &self.on_delete.len())
            .finish()
    }
}

impl Hooks {
    /// Runs the hooks for `mutation`'s action, stopping at the first error.
    ///
    /// Inserts, replaces and upserts run the insert hooks.
    ///
    /// # Errors
    ///
    /// * The first error a hook returns
    pub fn fire(&self, mutation: &Mutation<'_>) -> Result<(), DatabaseError> {
        let hooks = match mutation.action {
            Action::Insert | Action::Replace | Action::InsertOrUpdate => &self.on_insert,
            Action::Update => &self.on_update,
            Action::Delete => &self.on_delete,
            Action::Find | Action::Exist | Action::Exec => return Ok(()),
        };

        for hook in hooks {
            hook(mutation)?;
        }

        Ok(())
    }
}

/// A [`Record`] stored in a table.
pub trait Model: Record {
    /// Table name without the connection's prefix
    const TABLE: &'static str;

    /// Database id, `""` for the default database
    const DB: &'static str = "";

    /// Name `Model.col` references in raw clauses resolve to.
    #[must_use]
    fn name() -> &'static str {
        model_name(std::any::type_name::<Self>())
    }

    /// Connection the DAO runs on.
    ///
    /// # Errors
    ///
    /// * If the connection cannot be opened
    fn connection() -> Result<Arc<Connection>, DatabaseError> {
        connection::instance(Self::DB)
    }

    /// Runs once after the DAO is built, e.g. to register hooks.
    ///
    /// # Errors
    ///
    /// * Whatever the model reports; the DAO is not registered
    fn init(_dao: &mut Dao<Self>) -> Result<(), DatabaseError> {
        Ok(())
    }
}

pub struct Dao<M: Model> {
    connection: Arc<Connection>,
    table: String,
    primary_key: String,
    descriptor: Arc<RecordDescriptor<M>>,
    fields: BTreeMap<&'static str, Field>,
    hooks: Hooks,
}

impl<M: Model> fmt::Debug for Dao<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dao")
            .field("model", &M::name())
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl<M: Model> Dao<M> {
    /// Builds the DAO on `connection`, reading the table's fields and running [`Model::init`].
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::TableNotFound`] if the table does not exist
    /// * If introspection fails or [`Model::init`] fails
    pub fn new(connection: Arc<Connection>) -> Result<Self, DatabaseError> {
        let table = format!("{}{}", connection.table_prefix(), M::TABLE);
        let descriptor = descriptor::<M>();

        let found = connection
            .find_table(&table)?
            .ok_or_else(|| DatabaseError::TableNotFound(table.clone()))?;

        let primary_key = descriptor
            .primary_key()
            .map(ToString::to_string)
            .or_else(|| found.primary_key().next().map(|x| x.name.clone()))
            .unwrap_or_else(|| "id".to_string());

        let mut fields = BTreeMap::new();
        for mut field in found.fields {
            let Some(binding) = descriptor.by_column(&field.name) else {
                continue;
            };
            match binding.kind.convert(field.default_value.clone()) {
                Ok(value) => field.default_value = value,
                Err(e) => log::debug!(
                    "new: default of {table}.{} does not fit {}: {e}",
                    field.name,
                    binding.kind
                ),
            }
            fields.insert(binding.attribute, field);
        }

        log::debug!(
            "new: dao for {} on table '{table}' primary_key={primary_key} fields={}",
            M::name(),
            fields.len()
        );

        let mut dao = Self {
            connection,
            table,
            primary_key,
            descriptor,
            fields,
            hooks: Hooks::default(),
        };
        M::init(&mut dao)?;

        Ok(dao)
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    #[must_use]
    pub const fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    #[must_use]
    pub fn descriptor(&self) -> &RecordDescriptor<M> {
        &self.descriptor
    }

    /// Table fields keyed by the attribute they are bound to.
    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<&'static str, Field> {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, attribute: &str) -> Option<&Field> {
        self.fields.get(attribute)
    }

    /// Join target for another model's query.
    #[must_use]
    pub fn view(&self) -> TableRef {
        TableRef::new(&self.table, Some(M::name()))
    }

    pub fn on_insert(
        &mut self,
        hook: impl Fn(&Mutation<'_>) -> Result<(), DatabaseError> + Send + Sync + 'static,
    ) {
        self.hooks.on_insert.push(Box::new(hook));
    }

    pub fn on_update(
        &mut self,
        hook: impl Fn(&Mutation<'_>) -> Result<(), DatabaseError> + Send + Sync + 'static,
    ) {
        self.hooks.on_update.push(Box::new(hook));
    }

    pub fn on_delete(
        &mut self,
        hook: impl Fn(&Mutation<'_>) -> Result<(), DatabaseError> + Send + Sync + 'static,
    ) {
        self.hooks.on_delete.push(Box::new(hook));
    }

    /// A builder on this DAO's table that fires its hooks.
    #[must_use]
    pub fn query(&self) -> Query<'_> {
        Query::with(&*self.connection)
            .table(self.view())
            .primary_key(&self.primary_key)
            .hooks(&self.hooks)
    }

    /// # Errors
    ///
    /// * If the query fails or the row does not fit `M`
    pub fn find(&self, pk: impl Into<DatabaseValue>) -> Result<Option<M>, DatabaseError> {
        self.query().attr(&self.primary_key, pk).find()
    }

    /// Like [`Dao::find`] but a missing row is [`DatabaseError::NotFound`].
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::NotFound`] if no row has this key
    /// * If the query fails or the row does not fit `M`
    pub fn get(&self, pk: impl Into<DatabaseValue>) -> Result<M, DatabaseError> {
        self.find(pk)?.ok_or(DatabaseError::NotFound)
    }

    /// # Errors
    ///
    /// * If the query fails
    pub fn exist(&self, pk: impl Into<DatabaseValue>) -> Result<bool, DatabaseError> {
        self.query().attr(&self.primary_key, pk).exist()
    }

    /// # Errors
    ///
    /// * If the query or a delete hook fails
    pub fn delete(&self, pk: impl Into<DatabaseValue>) -> Result<ExecResult, DatabaseError> {
        self.query().attr(&self.primary_key, pk).delete()
    }

    /// Inserts `record` when its primary key is unset, updates the row otherwise.
    ///
    /// Only set attributes are written and the primary key is never part of the assignments.
    /// An insert stamps `created_at`/`createdAt` and assigns the generated key back to `record`;
    /// an update stamps `updated_at`/`updatedAt`.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] if there is nothing to write
    /// * If the query or a hook fails
    pub fn save(&self, record: &mut M) -> Result<ExecResult, DatabaseError> {
        self.save_with(self.query(), record)
    }

    /// [`Dao::save`] inside `tx`.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] if there is nothing to write
    /// * If the query or a hook fails
    pub fn save_in_tx(&self, tx: &Transaction, record: &mut M) -> Result<ExecResult, DatabaseError> {
        self.save_with(self.query().in_tx(tx), record)
    }

    fn save_with(&self, mut query: Query<'_>, record: &mut M) -> Result<ExecResult, DatabaseError> {
        let pk = self.descriptor.by_column(&self.primary_key);
        let update = pk.is_some_and(|x| (x.is_set)(record));
        let stamps = if update { UPDATED_AT } else { CREATED_AT };
        let now = DatabaseValue::UInt64(tea_time::unix_secs());

        for binding in self.descriptor.bindings() {
            if binding.column == self.primary_key
                || (!self.fields.is_empty() && !self.fields.contains_key(binding.attribute))
            {
                continue;
            }

            if stamps.contains(&binding.column) {
                let value = binding.kind.convert(now.clone())?;
                (binding.set)(record, value.clone())?;
                query = query.set(binding.column, value);
            } else if (binding.is_set)(record) {
                query = query.set(binding.column, (binding.get)(record));
            }
        }

        match pk {
            Some(pk) if update => query.attr(pk.column, (pk.get)(record)).update(),
            _ => {
                let result = query.insert()?;
                if let (Some(id), Some(pk)) = (result.last_insert_id, pk) {
                    (pk.set)(record, pk.kind.convert(DatabaseValue::UInt64(id))?)?;
                }
                Ok(result)
            }
        }
    }
}

/// Last path segment of a type name, without generic arguments.
fn model_name(type_name: &str) -> &str {
    let path = type_name.split('<').next().unwrap_or(type_name);
    path.rsplit("::").next().unwrap_or(path)
}

type InitErrorHandler = Box<dyn Fn(&str, DatabaseError) -> DatabaseError + Send + Sync>;

type DaoSlot = Arc<Mutex<Option<Arc<dyn Any + Send + Sync>>>>;

static DAOS: LazyLock<RwLock<HashMap<TypeId, DaoSlot>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

static INIT_ERROR_HANDLER: RwLock<Option<InitErrorHandler>> = RwLock::new(None);

/// Transforms or logs the error of a failed DAO initialization before [`dao`] returns it.
/// Receives the model name.
pub fn set_init_error_handler(
    handler: impl Fn(&str, DatabaseError) -> DatabaseError + Send + Sync + 'static,
) {
    *INIT_ERROR_HANDLER
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(handler));
}

fn slot<M: Model>() -> DaoSlot {
    if let Some(slot) = DAOS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&TypeId::of::<M>())
    {
        return slot.clone();
    }

    DAOS.write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(TypeId::of::<M>())
        .or_default()
        .clone()
}

/// Shared DAO for `M`, built on first use.
///
/// Each model has its own slot lock, so [`Model::init`] runs once and may look up the DAOs of
/// other models. Two models whose `init`s look up each other deadlock. A failed build leaves
/// the slot empty and the next call tries again.
///
/// # Errors
///
/// * If the connection cannot be opened, the table is missing or [`Model::init`] fails
pub fn dao<M: Model>() -> Result<Arc<Dao<M>>, DatabaseError> {
    let slot = slot::<M>();
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(existing) = slot
        .as_ref()
        .and_then(|x| x.clone().downcast::<Dao<M>>().ok())
    {
        return Ok(existing);
    }

    let built = match M::connection().and_then(Dao::<M>::new) {
        Ok(built) => Arc::new(built),
        Err(e) => {
            log::debug!("dao: init of {} failed: {e:?}", M::name());
            let handler = INIT_ERROR_HANDLER
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            return Err(match handler.as_ref() {
                Some(handler) => handler(M::name(), e),
                None => e,
            });
        }
    };

    log::trace!("dao: registered {}", M::name());
    *slot = Some(built.clone());
    drop(slot);

    Ok(built)
}
