//! Built-in demo catalog
//!
//! The binary ships with a handful of small suites exercising the engine:
//! plain tests, a capability-backed case, a step plan, an async case and a
//! flow-driven case. Selectors and execution groups from the command line apply to it
//! like to any other catalog.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::case::{CaseClass, StepPlan};
use crate::config::RunConfig;
use crate::context::{HookEvent, Layer, LayerHandle};
use crate::error::EngineResult;
use crate::extension::{Capability, Registry};
use crate::models::{ensure, ensure_eq, Signal};
use crate::program::{Program, Script};
use crate::suite::Suite;

/// Names of the demo suites, in declaration order
pub const DEMO_SUITES: &[&str] = &["arith", "inventory", "checkout", "browsers"];

/// Capability name of the in-memory stock store
pub const INVENTORY: &str = "inventory";

/// In-memory stock store handed out per owner
#[derive(Debug, Default)]
pub struct Inventory {
    stock: BTreeMap<String, u32>,
}

impl Inventory {
    pub fn add(&mut self, item: &str, count: u32) {
        *self.stock.entry(item.to_string()).or_default() += count;
    }

    pub fn take(&mut self, item: &str, count: u32) -> Result<(), Signal> {
        let left = self.stock.get_mut(item).ok_or_else(|| Signal::fail(format!("no {item} in stock")))?;
        if *left < count {
            return Err(Signal::fail(format!("only {left} {item} left")));
        }
        *left -= count;
        Ok(())
    }

    pub fn count(&self, item: &str) -> u32 {
        self.stock.get(item).copied().unwrap_or(0)
    }
}

/// Logs every failing outcome
struct OutcomeLog;

impl Layer for OutcomeLog {
    fn name(&self) -> &str {
        "outcome-log"
    }

    fn on_any_error(&self, event: &HookEvent<'_>) -> anyhow::Result<()> {
        let message = event.data.and_then(|data| data.message()).unwrap_or_default();
        warn!("{} {} failed: {}", event.kind, event.id, message);
        Ok(())
    }

    fn on_success(&self, event: &HookEvent<'_>) -> anyhow::Result<()> {
        debug!("{} {} passed", event.kind, event.id);
        Ok(())
    }
}

/// Registry with the demo capabilities and layers
pub fn registry() -> EngineResult<Arc<Registry>> {
    let registry = Registry::shared();
    registry.register_fn(INVENTORY, || {
        let mut inventory = Inventory::default();
        inventory.add("apple", 3);
        inventory.add("pear", 1);
        Ok(Box::new(inventory) as Capability)
    })?;
    registry.layers().add_default(LayerHandle::new(OutcomeLog));
    Ok(registry)
}

/// The demo suites
pub fn catalog() -> Vec<Suite> {
    vec![arith(), inventory(), checkout(), browsers()]
}

/// Demo program assembled from `config`
pub fn program(config: RunConfig) -> EngineResult<Program> {
    let mut program = Program::new(registry()?, config)?
        .before(Script::new("announce", || {
            debug!("Demo catalog starting");
            Ok(())
        }))
        .after(Script::new("farewell", || {
            debug!("Demo catalog finished");
            Ok(())
        }));
    for suite in catalog() {
        program.add_suite(suite);
    }
    Ok(program)
}

fn arith() -> Suite {
    Suite::new("arith")
        .case(
            CaseClass::new("Integers")
                .test("test_add", |_| ensure_eq(2 + 2, 4))
                .test("test_checked_overflow", |_| ensure(i32::MAX.checked_add(1).is_none(), "overflow not caught"))
                .test("test_division", |ctx| {
                    ctx.reason("operands", "7 / 2");
                    ensure_eq(7 / 2, 3)
                }),
        )
        .case(
            CaseClass::new("Floats")
                .test("test_rounding", |_| ensure_eq((2.5f64).round(), 3.0))
                .test("test_nan", |_| ensure(f64::NAN.is_nan(), "NaN compares equal"))
                .repeatable(Some(2)),
        )
        .case(CaseClass::from_fn("Bignum", |_| Ok(())).skip("bignum support not built"))
}

fn inventory() -> Suite {
    Suite::new("inventory").requires([INVENTORY]).case(
        CaseClass::new("Stock")
            .requires([INVENTORY])
            .setup(|ctx| {
                ctx.capability::<Inventory>(INVENTORY)?.add("plum", 2);
                Ok(())
            })
            .test("test_take_available", |ctx| {
                let inventory = ctx.capability::<Inventory>(INVENTORY)?;
                inventory.take("apple", 2)?;
                ensure_eq(inventory.count("apple"), 1)
            })
            .test("test_setup_stock", |ctx| {
                let inventory = ctx.capability::<Inventory>(INVENTORY)?;
                ensure_eq(inventory.count("plum"), 2)
            })
            .test("test_cannot_oversell", |ctx| {
                let inventory = ctx.capability::<Inventory>(INVENTORY)?;
                ensure(inventory.take("pear", 5).is_err(), "oversold pears")
            }),
    )
}

fn checkout() -> Suite {
    let plan = StepPlan::new()
        .begin(|ctx| {
            ctx.reason("cart", "apple x2");
            Ok(())
        })
        .step(10, "add items to the cart", |ctx| {
            ctx.capability::<Inventory>(INVENTORY)?.take("apple", 2)
        })
        .step(20, "pay", |_| Ok(()))
        .step(30, "confirm the order", |ctx| {
            ensure_eq(ctx.capability::<Inventory>(INVENTORY)?.count("apple"), 1)
        });
    Suite::new("checkout")
        .case(CaseClass::new("Order").requires([INVENTORY]).steps("test_happy_path", plan))
        .case(CaseClass::new("Receipt").test_async("test_mailed_after_payment", |ctx| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ctx.reason("mailer", "queued");
                Ok(())
            })
        }))
}

fn browsers() -> Suite {
    Suite::new("browsers").case(
        CaseClass::new("Render")
            .flows(vec![
                serde_json::json!({ "browser": "firefox", "width": 1280 }),
                serde_json::json!({ "browser": "chromium", "width": 800 }),
            ])
            .test("test_viewport", |ctx| {
                let width = ctx
                    .flow()
                    .and_then(|flow| flow.get("width"))
                    .and_then(|width| width.as_u64())
                    .ok_or_else(|| Signal::error("flow without width"))?;
                ensure(width >= 800, format!("viewport {width} too narrow"))
            }),
    )
}
