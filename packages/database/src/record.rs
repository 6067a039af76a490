//! Record descriptors
//!
//! A [`Record`] lists its column bindings explicitly: attribute name, column name, value kind,
//! and a getter/setter pair. [`impl_record!`](crate::impl_record) writes that table for a plain
//! struct. [`descriptor`] builds the [`RecordDescriptor`] for a type once and hands out the same
//! shared copy afterwards.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{Arc, LazyLock, Mutex, PoisonError},
};

use crate::{DatabaseError, DatabaseValue, Row, TryFromError, kind::ValueKind};

/// A Rust type that can be stored in a bound column.
pub trait ColumnType: Sized {
    const KIND: ValueKind;

    fn to_value(&self) -> DatabaseValue;

    /// # Errors
    ///
    /// * If `value` does not fit this type
    fn from_value(value: DatabaseValue) -> Result<Self, TryFromError>;

    /// Whether the attribute holds a value. Plain types count their kind's zero as unset.
    fn is_set(&self) -> bool {
        !Self::KIND.is_zero(&self.to_value())
    }
}

macro_rules! impl_column_type {
    ($($type:ty => $kind:ident),* $(,)?) => {
        $(
            impl ColumnType for $type {
                const KIND: ValueKind = ValueKind::$kind;

                #[allow(clippy::clone_on_copy)]
                fn to_value(&self) -> DatabaseValue {
                    DatabaseValue::from(self.clone())
                }

                fn from_value(value: DatabaseValue) -> Result<Self, TryFromError> {
                    Self::try_from(ValueKind::$kind.convert(value)?)
                }
            }
        )*
    };
}

impl_column_type!(
    bool => Bool,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
    String => String,
);

/// Nullable column. `None` is the unset state, so `Some(0)` is a real value.
impl<T: ColumnType> ColumnType for Option<T> {
    const KIND: ValueKind = T::KIND;

    fn to_value(&self) -> DatabaseValue {
        self.as_ref().map_or(DatabaseValue::Null, ColumnType::to_value)
    }

    fn from_value(value: DatabaseValue) -> Result<Self, TryFromError> {
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(value).map(Some)
    }

    fn is_set(&self) -> bool {
        self.is_some()
    }
}

/// How one attribute of `R` maps to a column.
pub struct ColumnBinding<R> {
    pub attribute: &'static str,
    pub column: &'static str,
    pub kind: ValueKind,
    pub get: fn(&R) -> DatabaseValue,
    pub set: fn(&mut R, DatabaseValue) -> Result<(), TryFromError>,
    pub is_set: fn(&R) -> bool,
}

impl<R> fmt::Debug for ColumnBinding<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnBinding")
            .field("attribute", &self.attribute)
            .field("column", &self.column)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A type whose values can be read from and written to rows.
pub trait Record: Default + Send + Sync + 'static {
    /// Bound attributes in column order. Attributes without a binding are never read or written.
    fn bindings() -> Vec<ColumnBinding<Self>>;

    /// Column that identifies a row, if the type has one.
    #[must_use]
    fn primary_key() -> Option<&'static str> {
        None
    }
}

/// Implements [`Record`] for a struct with `Default`.
///
/// ```rust,ignore
/// impl_record!(User {
///     id: u64,
///     name: String => "user_name",
///     created_at: i64,
/// } primary_key = "id");
/// ```
///
/// A column name defaults to the attribute name.
#[macro_export]
macro_rules! impl_record {
    (@column $attr:ident) => {
        stringify!($attr)
    };
    (@column $attr:ident $column:literal) => {
        $column
    };
    (@primary_key) => {
        None
    };
    (@primary_key $pk:literal) => {
        Some($pk)
    };
    ($record:ident { $($attr:ident : $type:ty $(=> $column:literal)?),* $(,)? } $(primary_key = $pk:literal)?) => {
        impl $crate::record::Record for $record {
            fn bindings() -> Vec<$crate::record::ColumnBinding<Self>> {
                vec![
                    $(
                        $crate::record::ColumnBinding {
                            attribute: stringify!($attr),
                            column: $crate::impl_record!(@column $attr $($column)?),
                            kind: <$type as $crate::record::ColumnType>::KIND,
                            get: |record: &Self| {
                                $crate::record::ColumnType::to_value(&record.$attr)
                            },
                            set: |record: &mut Self, value| {
                                record.$attr =
                                    <$type as $crate::record::ColumnType>::from_value(value)?;
                                Ok(())
                            },
                            is_set: |record: &Self| {
                                $crate::record::ColumnType::is_set(&record.$attr)
                            },
                        },
                    )*
                ]
            }

            fn primary_key() -> Option<&'static str> {
                $crate::impl_record!(@primary_key $($pk)?)
            }
        }
    };
}

/// Column metadata for one record type, built once by [`descriptor`].
pub struct RecordDescriptor<R> {
    name: &'static str,
    bindings: Vec<ColumnBinding<R>>,
    by_column: HashMap<&'static str, usize>,
    by_attribute: HashMap<&'static str, usize>,
    primary_key: Option<&'static str>,
}

impl<R> fmt::Debug for RecordDescriptor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordDescriptor")
            .field("name", &self.name)
            .field("bindings", &self.bindings)
            .field("primary_key", &self.primary_key)
            .finish_non_exhaustive()
    }
}

impl<R: Record> RecordDescriptor<R> {
    fn build() -> Self {
        let bindings = R::bindings();
        let by_column = bindings
            .iter()
            .enumerate()
            .map(|(i, x)| (x.column, i))
            .collect();
        let by_attribute = bindings
            .iter()
            .enumerate()
            .map(|(i, x)| (x.attribute, i))
            .collect();

        Self {
            name: std::any::type_name::<R>(),
            bindings,
            by_column,
            by_attribute,
            primary_key: R::primary_key(),
        }
    }

    /// Type name the descriptor was built for.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn bindings(&self) -> &[ColumnBinding<R>] {
        &self.bindings
    }

    /// Column names in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.bindings.iter().map(|x| x.column)
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&'static str> {
        self.primary_key
    }

    #[must_use]
    pub fn by_column(&self, column: &str) -> Option<&ColumnBinding<R>> {
        self.by_column.get(column).map(|&i| &self.bindings[i])
    }

    #[must_use]
    pub fn by_attribute(&self, attribute: &str) -> Option<&ColumnBinding<R>> {
        self.by_attribute.get(attribute).map(|&i| &self.bindings[i])
    }

    /// Column to attribute lookup.
    #[must_use]
    pub fn attribute(&self, column: &str) -> Option<&'static str> {
        self.by_column(column).map(|x| x.attribute)
    }

    #[must_use]
    pub fn kind(&self, column: &str) -> Option<ValueKind> {
        self.by_column(column).map(|x| x.kind)
    }

    #[must_use]
    pub fn get(&self, record: &R, column: &str) -> Option<DatabaseValue> {
        self.by_column(column).map(|x| (x.get)(record))
    }

    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] if `column` is not bound
    /// * If `value` does not fit the attribute
    pub fn set(&self, record: &mut R, column: &str, value: DatabaseValue) -> Result<(), DatabaseError> {
        let binding = self
            .by_column(column)
            .ok_or_else(|| DatabaseError::InvalidQuery(format!("{} has no column '{column}'", self.name)))?;
        (binding.set)(record, value)?;
        Ok(())
    }

    /// All bound columns of `record` as a row.
    #[must_use]
    pub fn to_row(&self, record: &R) -> Row {
        Row {
            columns: self
                .bindings
                .iter()
                .map(|x| (x.column.to_string(), (x.get)(record)))
                .collect(),
        }
    }

    /// Copies the bound columns of `row` into a new record, converting each to its kind.
    /// Columns the record does not bind are skipped.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::RowScan`] if a value does not fit its attribute
    pub fn from_row(&self, row: &Row) -> Result<R, DatabaseError> {
        let mut record = R::default();

        for (column, value) in &row.columns {
            let Some(binding) = self.by_column(column) else {
                continue;
            };
            (binding.set)(&mut record, value.clone()).map_err(|e| {
                DatabaseError::RowScan(format!("{}.{}: {e}", self.name, binding.attribute))
            })?;
        }

        Ok(record)
    }
}

static DESCRIPTORS: LazyLock<Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Shared descriptor for `R`, built on first request.
#[must_use]
pub fn descriptor<R: Record>() -> Arc<RecordDescriptor<R>> {
    if let Some(existing) = cached_descriptor::<R>(
        &DESCRIPTORS.lock().unwrap_or_else(PoisonError::into_inner),
    ) {
        return existing;
    }

    // Built unlocked so `bindings` may ask for other descriptors.
    log::trace!("descriptor: building for {}", std::any::type_name::<R>());
    let built = Arc::new(RecordDescriptor::<R>::build());

    let mut descriptors = DESCRIPTORS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = cached_descriptor::<R>(&descriptors) {
        return existing;
    }
    descriptors.insert(TypeId::of::<R>(), built.clone());
    drop(descriptors);
    built
}

fn cached_descriptor<R: Record>(
    descriptors: &HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
) -> Option<Arc<RecordDescriptor<R>>> {
    descriptors
        .get(&TypeId::of::<R>())
        .and_then(|x| x.clone().downcast::<RecordDescriptor<R>>().ok())
}
