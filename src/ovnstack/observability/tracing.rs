/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


//! Span identifiers for correlating log lines of one provisioning run or one
//! CNI invocation. Spans are backed by the `tracing` crate; the active
//! [`TraceContext`] is also kept per thread so the logger can stamp
//! `trace_id` / `span_id` on every line.

use rand::{rngs::OsRng, RngCore};
use std::cell::RefCell;
use std::fmt::Write;
use std::future::{poll_fn, Future};
use std::pin::pin;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

thread_local! {
    static ACTIVE_TRACE: RefCell<Option<TraceContext>> = const { RefCell::new(None) };
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber exactly once.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let subscriber = Registry::default();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Returns the [`TraceContext`] active on this thread, if any.
pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.with(|active| active.borrow().clone())
}

struct Restore(Option<TraceContext>);

impl Drop for Restore {
    fn drop(&mut self) {
        let previous = self.0.take();
        ACTIVE_TRACE.with(|active| *active.borrow_mut() = previous);
    }
}

fn install(context: Option<TraceContext>) -> Restore {
    let previous = ACTIVE_TRACE.with(|active| active.replace(context));
    Restore(previous)
}

fn open_span(component: &'static str, name: &str) -> (tracing::Span, TraceContext) {
    let trace_id = current_context()
        .map(|ctx| ctx.trace_id)
        .unwrap_or_else(|| Arc::<str>::from(generate_trace_id()));
    let span_id = Arc::<str>::from(generate_span_id());
    let span = tracing::info_span!(
        "ovnstack",
        component = component,
        span = name,
        trace_id = trace_id.as_ref(),
        span_id = span_id.as_ref(),
    );
    (span, TraceContext { trace_id, span_id })
}

/// Run `f` inside a new span. The trace id is inherited from the enclosing
/// span on this thread, or freshly generated.
pub fn with_span<T>(component: &'static str, span_name: impl Into<String>, f: impl FnOnce() -> T) -> T {
    let (span, context) = open_span(component, &span_name.into());
    let _entered = span.enter();
    let _restore = install(Some(context));
    f()
}

/// Drive `fut` inside a new span. The span and its [`TraceContext`] are
/// active during every poll and released in between.
pub async fn with_span_async<F: Future>(
    component: &'static str,
    span_name: impl Into<String>,
    fut: F,
) -> F::Output {
    let (span, context) = open_span(component, &span_name.into());
    let mut fut = pin!(fut);
    poll_fn(move |cx| {
        let _entered = span.enter();
        let _restore = install(Some(context.clone()));
        fut.as_mut().poll(cx)
    })
    .await
}

/// Run `f` with a context captured on another thread, so work handed to a
/// dedicated thread keeps logging under the caller's span.
pub fn with_context<T>(context: Option<TraceContext>, f: impl FnOnce() -> T) -> T {
    let _restore = install(context);
    f()
}

fn generate_trace_id() -> String {
    random_hex(16)
}

fn generate_span_id() -> String {
    random_hex(8)
}

fn random_hex(bytes: usize) -> String {
    let mut data = vec![0u8; bytes];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(bytes * 2);
    for byte in data {
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}
