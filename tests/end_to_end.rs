//! End-to-end behavior of a store built from registered state types.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future;
use openerp_fluxstore::*;
use serde_json::json;

// ── Cart states ──

#[derive(Debug)]
struct AddItem(&'static str);

impl TypedAction for AddItem {
    const TYPE: &'static str = "[Cart] Add item";
}

#[derive(Default)]
struct CartState;

impl StateType for CartState {
    fn define() -> StateBuilder<Self> {
        StateBuilder::new("cart")
            .defaults(json!({"items": []}))
            .child::<SavedState>()
            .on::<AddItem, _, _>("add_item", |_, ctx, action| {
                ctx.set_state(json!({"items": [action.0]}))
            })
    }
}

#[derive(Default)]
struct SavedState;

impl StateType for SavedState {
    fn define() -> StateBuilder<Self> {
        StateBuilder::new("saved").defaults(json!({"count": 0}))
    }
}

fn cart_store(config: StoreConfig) -> Store {
    let states = [
        ensure_metadata::<CartState>().unwrap(),
        ensure_metadata::<SavedState>().unwrap(),
    ];
    Store::new(&states, config).unwrap()
}

fn record(store: &Store, filter: ActionFilter) -> Arc<Mutex<Vec<ActionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_c = seen.clone();
    store
        .actions()
        .subscribe_matching(filter, move |ctx| seen_c.lock().unwrap().push(ctx.status));
    seen
}

#[test]
fn add_item_to_cart() {
    let store = cart_store(StoreConfig::default());
    assert_eq!(
        store.snapshot().to_json(),
        json!({"cart": {"items": [], "saved": {"count": 0}}})
    );
    let seen = record(&store, ActionFilter::of::<AddItem>());

    let result = store.dispatch(AddItem("x")).peek().unwrap().unwrap();
    assert_eq!(
        store.snapshot().to_json(),
        json!({"cart": {"items": ["x"], "saved": {"count": 0}}})
    );
    assert!(result.unwrap().ptr_eq(&store.snapshot()));
    assert_eq!(
        *seen.lock().unwrap(),
        [ActionStatus::Dispatched, ActionStatus::Successful]
    );
}

#[test]
fn parent_set_state_keeps_child_slice() {
    let store = cart_store(StoreConfig::default());
    let saved_before = store.select_snapshot("cart.saved").unwrap().unwrap();

    store.dispatch(AddItem("x"));
    store.dispatch(AddItem("y"));
    assert_eq!(
        store.snapshot().to_json(),
        json!({"cart": {"items": ["y"], "saved": {"count": 0}}})
    );
    let saved_after = store.select_snapshot("cart.saved").unwrap().unwrap();
    assert!(saved_after.ptr_eq(&saved_before));
}

#[test]
fn sibling_slices_keep_identity() {
    let store = cart_store(StoreConfig::default());
    let saved_before = store.select_snapshot("cart.saved").unwrap().unwrap();

    store.dispatch(AddItem("x"));
    let saved_after = store.select_snapshot("cart.saved").unwrap().unwrap();
    assert!(saved_after.ptr_eq(&saved_before));
}

#[test]
fn selector_with_owner_reads_its_slice() {
    let store = cart_store(StoreConfig::default());
    let cart = ensure_metadata::<CartState>().unwrap();
    let count = create_selector(
        vec![],
        |args: &[StateValue]| {
            let items = args[0].field("items")?;
            Ok(StateValue::from(items.as_list().map_or(0, |l| l.len())))
        },
        Some(&cart),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_c = seen.clone();
    store.select(&count, move |selection| {
        seen_c.lock().unwrap().push(selection.unwrap());
    });
    store.dispatch(AddItem("x"));

    assert_eq!(
        *seen.lock().unwrap(),
        [Some(StateValue::from(0)), Some(StateValue::from(1))]
    );
}

// ── Errors ──

#[test]
fn batch_error_reaches_hook_once() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let hook_c = hook_calls.clone();
    let config = StoreConfig::default().with_error_hook(move |_| {
        hook_c.fetch_add(1, Ordering::Relaxed);
    });

    #[derive(Default)]
    struct Fragile;
    let fragile = StateBuilder::<Fragile>::new("fragile")
        .on_types(&["break"], "break", HandlerOptions::default(), |_, _, _| {
            Err::<(), _>(anyhow::anyhow!("broken"))
        })
        .build()
        .unwrap();
    let store = Store::new(&[fragile], config).unwrap();
    let seen = record(&store, ActionFilter::of_action(["break"]).errored());

    let batch: Vec<ActionRef> = (0..3)
        .map(|_| Arc::new(DynAction::new("break")) as ActionRef)
        .collect();
    let err = store.dispatch_all(batch).peek().unwrap().unwrap_err();

    assert_eq!(err.error_code(), "DISPATCH_FAILED");
    assert_eq!(hook_calls.load(Ordering::Relaxed), 1);
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[test]
fn circular_states_are_rejected() {
    #[derive(Default)]
    struct Egg;
    #[derive(Default)]
    struct Hen;
    impl StateType for Egg {
        fn define() -> StateBuilder<Self> {
            StateBuilder::new("egg").child::<Hen>()
        }
    }
    impl StateType for Hen {
        fn define() -> StateBuilder<Self> {
            StateBuilder::new("hen").child::<Egg>()
        }
    }

    let states = [ensure_metadata::<Egg>().unwrap(), ensure_metadata::<Hen>().unwrap()];
    let err = Store::new(&states, StoreConfig::default()).err().unwrap();
    match err {
        StoreError::CircularDependency { chain, .. } => assert_eq!(chain.len(), 3),
        other => panic!("unexpected error: {other}"),
    }
}

// ── Features and lifecycle ──

#[test]
fn feature_registration_runs_init_once() {
    let store = cart_store(StoreConfig::default());
    let inits = Arc::new(AtomicUsize::new(0));
    let inits_c = inits.clone();

    #[derive(Default)]
    struct Orders;
    let orders = StateBuilder::<Orders>::new("orders")
        .defaults(json!({"open": 0}))
        .on_init(move |_, ctx| {
            inits_c.fetch_add(1, Ordering::Relaxed);
            ctx.patch_state(json!({"open": 5})).unwrap();
        })
        .build()
        .unwrap();

    store.add_feature(&[orders.clone()], vec![]).unwrap();
    store.add_feature(&[orders], vec![]).unwrap();

    assert_eq!(inits.load(Ordering::Relaxed), 1);
    assert_eq!(store.select_snapshot("orders.open").unwrap(), Some(StateValue::from(5)));
    assert_eq!(store.select_snapshot("cart.saved.count").unwrap(), Some(StateValue::from(0)));
}

// ── Asynchronous handlers ──

#[derive(Debug)]
struct Search(bool);

impl TypedAction for Search {
    const TYPE: &'static str = "[Search] Run";
}

#[tokio::test]
async fn newer_search_cancels_stale_one() {
    #[derive(Default)]
    struct SearchState;
    let search = StateBuilder::<SearchState>::new("search")
        .defaults(json!({"runs": 0}))
        .on_with::<Search, _, _>("run", HandlerOptions::cancel_uncompleted(), |_, ctx, action| {
            let ctx = ctx.clone();
            let stale = action.0;
            Handled::future(async move {
                if stale {
                    future::pending::<()>().await;
                }
                let runs = ctx.get_state().get("runs").and_then(StateValue::as_i64).unwrap_or(0);
                ctx.patch_state(json!({"runs": runs + 1}))?;
                Ok(())
            })
        })
        .build()
        .unwrap();
    let store = Store::new(&[search], StoreConfig::default()).unwrap();
    let seen = record(&store, ActionFilter::of::<Search>().canceled());

    let first = store.dispatch(Search(true));
    let second = store.dispatch(Search(false));

    assert!(second.await.unwrap().is_some());
    assert!(first.await.unwrap().is_none());
    assert_eq!(*seen.lock().unwrap(), [ActionStatus::Canceled]);
    assert_eq!(store.select_snapshot("search.runs").unwrap(), Some(StateValue::from(1)));
}

#[tokio::test]
async fn nested_dispatch_from_async_handler() {
    #[derive(Default)]
    struct Loader;
    let loader = StateBuilder::<Loader>::new("loader")
        .defaults(json!({"loaded": false}))
        .on_types(&["load"], "load", HandlerOptions::default(), |_, ctx, _| {
            let ctx = ctx.clone();
            Handled::future(async move {
                tokio::task::yield_now().await;
                ctx.dispatch(DynAction::new("loaded")).await?;
                Ok(())
            })
        })
        .on_types(&["loaded"], "loaded", HandlerOptions::default(), |_, ctx, _| {
            ctx.set_state(json!({"loaded": true}));
        })
        .build()
        .unwrap();
    let store = Store::new(&[loader], StoreConfig::default()).unwrap();

    let state = store.dispatch(DynAction::new("load")).await.unwrap().unwrap();
    assert_eq!(state.to_json(), json!({"loader": {"loaded": true}}));
}
