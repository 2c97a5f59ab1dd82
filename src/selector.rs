//! Memoized projections over the state tree.
//!
//! A [`Selector`] combines input readers with a projector. The projector
//! only re-runs when one of its inputs changed by reference, so selectors
//! over untouched slices stay cheap however often the tree is published.
//!
//! ```ignore
//! let count = create_selector(
//!     vec!["cart.items".into()],
//!     |args: &[StateValue]| Ok(StateValue::from(args[0].as_list().map_or(0, |l| l.len()))),
//!     None,
//! );
//! let n = count.select(&store.snapshot())?;
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::StoreError;
use crate::metadata::StateDescriptor;
use crate::path::get_at;
use crate::value::StateValue;

/// A function from the whole state tree to a derived value.
pub type TreeReader = Arc<dyn Fn(&StateValue) -> Result<StateValue, StoreError> + Send + Sync>;

type ArgsFn = Arc<dyn Fn(&[StateValue]) -> Result<StateValue, StoreError> + Send + Sync>;

fn same_args(prev: &[StateValue], next: &[StateValue]) -> bool {
    prev.len() == next.len() && prev.iter().zip(next).all(|(a, b)| a.ptr_eq(b))
}

// ── Memoization ──

/// A function that remembers its last argument list and result.
///
/// A call whose arguments are pairwise [`ptr_eq`](StateValue::ptr_eq) to the
/// previous call returns the previous result without running the function.
/// Failed calls are not remembered.
#[derive(Clone)]
pub struct MemoizedFn {
    inner: Arc<MemoInner>,
}

struct MemoInner {
    func: ArgsFn,
    last: Mutex<Option<(Vec<StateValue>, StateValue)>>,
}

impl MemoizedFn {
    fn from_arc(func: ArgsFn) -> Self {
        Self {
            inner: Arc::new(MemoInner {
                func,
                last: Mutex::new(None),
            }),
        }
    }

    pub fn call(&self, args: &[StateValue]) -> Result<StateValue, StoreError> {
        {
            let last = self.inner.last.lock().unwrap();
            if let Some((prev_args, prev)) = last.as_ref() {
                if same_args(prev_args, args) {
                    return Ok(prev.clone());
                }
            }
        }
        let value = (self.inner.func)(args)?;
        *self.inner.last.lock().unwrap() = Some((args.to_vec(), value.clone()));
        Ok(value)
    }
}

impl fmt::Debug for MemoizedFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MemoizedFn(..)")
    }
}

pub fn memoize<F>(func: F) -> MemoizedFn
where
    F: Fn(&[StateValue]) -> Result<StateValue, StoreError> + Send + Sync + 'static,
{
    MemoizedFn::from_arc(Arc::new(func))
}

/// A parametrized selector returned by a projector, wrapped with
/// [`StateValue::opaque`].
///
/// [`create_selector`] replaces it with a [`MemoizedFn`] that has its own
/// cache, so callers read it back with `downcast_ref::<MemoizedFn>()`.
#[derive(Clone)]
pub struct SelectorFn(ArgsFn);

impl SelectorFn {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&[StateValue]) -> Result<StateValue, StoreError> + Send + Sync + 'static,
    {
        Self(Arc::new(func))
    }

    fn memoized(&self) -> MemoizedFn {
        MemoizedFn::from_arc(self.0.clone())
    }
}

// ── Selectors ──

/// What a selector input can be built from.
#[derive(Clone)]
pub enum SelectorRef {
    Selector(Selector),
    /// The registered slice of a state descriptor.
    State(StateDescriptor),
    /// A dotted path into the tree.
    Path(String),
    Reader(TreeReader),
}

impl SelectorRef {
    pub fn reader<F>(read: F) -> Self
    where
        F: Fn(&StateValue) -> Result<StateValue, StoreError> + Send + Sync + 'static,
    {
        SelectorRef::Reader(Arc::new(read))
    }
}

impl From<Selector> for SelectorRef {
    fn from(selector: Selector) -> Self {
        SelectorRef::Selector(selector)
    }
}

impl From<&Selector> for SelectorRef {
    fn from(selector: &Selector) -> Self {
        SelectorRef::Selector(selector.clone())
    }
}

impl From<StateDescriptor> for SelectorRef {
    fn from(descriptor: StateDescriptor) -> Self {
        SelectorRef::State(descriptor)
    }
}

impl From<&StateDescriptor> for SelectorRef {
    fn from(descriptor: &StateDescriptor) -> Self {
        SelectorRef::State(descriptor.clone())
    }
}

impl From<&str> for SelectorRef {
    fn from(path: &str) -> Self {
        SelectorRef::Path(path.to_string())
    }
}

impl From<String> for SelectorRef {
    fn from(path: String) -> Self {
        SelectorRef::Path(path)
    }
}

impl fmt::Debug for SelectorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorRef::Selector(s) => f.debug_tuple("Selector").field(s).finish(),
            SelectorRef::State(d) => f.debug_tuple("State").field(&d.name()).finish(),
            SelectorRef::Path(p) => f.debug_tuple("Path").field(p).finish(),
            SelectorRef::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// A memoized projection over input readers.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<SelectorInner>,
}

struct SelectorInner {
    owner: Option<StateDescriptor>,
    projector: MemoizedFn,
    reader: TreeReader,
}

impl Selector {
    /// The reader over the whole tree. A `MissingPath` error means the
    /// selection is undefined.
    pub fn reader(&self) -> TreeReader {
        self.inner.reader.clone()
    }

    /// Select from `tree`; `None` when the projection reached a missing path.
    pub fn select(&self, tree: &StateValue) -> Result<Option<StateValue>, StoreError> {
        read(&self.inner.reader, tree)
    }

    /// Call the memoized projector directly with already-resolved inputs.
    pub fn project(&self, args: &[StateValue]) -> Result<StateValue, StoreError> {
        self.inner.projector.call(args)
    }

    pub fn owner(&self) -> Option<&StateDescriptor> {
        self.inner.owner.as_ref()
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("owner", &self.inner.owner.as_ref().map(|d| d.name().to_string()))
            .finish_non_exhaustive()
    }
}

/// Build a memoized selector.
///
/// With an `owner`, the owner's slice is prepended as the first input. An
/// input that reads a missing path reaches the projector as `Null`. When
/// the projector returns a [`SelectorFn`], the function is memoized on its
/// own arguments as well.
pub fn create_selector<F>(
    inputs: Vec<SelectorRef>,
    projector: F,
    owner: Option<&StateDescriptor>,
) -> Selector
where
    F: Fn(&[StateValue]) -> Result<StateValue, StoreError> + Send + Sync + 'static,
{
    let projector = memoize(move |args: &[StateValue]| {
        let value = projector(args)?;
        Ok(match value.downcast_ref::<SelectorFn>() {
            Some(func) => StateValue::opaque(func.memoized()),
            None => value,
        })
    });

    let mut refs = Vec::with_capacity(inputs.len() + 1);
    if let Some(owner) = owner {
        refs.push(SelectorRef::State(owner.clone()));
    }
    refs.extend(inputs);
    let readers: Vec<TreeReader> = refs.iter().map(resolve_selector_fn).collect();

    let memo = projector.clone();
    let reader: TreeReader = Arc::new(move |tree: &StateValue| {
        let args = readers
            .iter()
            .map(|read| match read(tree) {
                Err(StoreError::MissingPath(_)) => Ok(StateValue::Null),
                other => other,
            })
            .collect::<Result<Vec<_>, _>>()?;
        memo.call(&args)
    });

    Selector {
        inner: Arc::new(SelectorInner {
            owner: owner.cloned(),
            projector,
            reader,
        }),
    }
}

/// Resolve a selector reference to a reader over the whole tree.
///
/// State descriptors are read at their registered path, looked up on every
/// call so a selector may be built before the state is registered.
pub fn resolve_selector_fn(selector: &SelectorRef) -> TreeReader {
    match selector {
        SelectorRef::Selector(s) => s.reader(),
        SelectorRef::Reader(read) => read.clone(),
        SelectorRef::Path(path) => path_reader(path.clone()),
        SelectorRef::State(descriptor) => {
            let descriptor = descriptor.clone();
            Arc::new(move |tree: &StateValue| match descriptor.path() {
                Some(path) => read_path(tree, &path),
                None => Err(StoreError::MissingPath(descriptor.name().to_string())),
            })
        }
    }
}

fn path_reader(path: String) -> TreeReader {
    Arc::new(move |tree: &StateValue| read_path(tree, &path))
}

fn read_path(tree: &StateValue, path: &str) -> Result<StateValue, StoreError> {
    get_at(tree, path).ok_or_else(|| StoreError::MissingPath(path.to_string()))
}

/// Run `reader`, mapping a missing path to `None`.
pub fn read(reader: &TreeReader, tree: &StateValue) -> Result<Option<StateValue>, StoreError> {
    match reader(tree) {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::MissingPath(path)) => {
            trace!(path = %path, "selection reached a missing path");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
