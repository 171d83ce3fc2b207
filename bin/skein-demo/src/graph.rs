use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use skein_core::{
    context::{FunctionContext, Next},
    escalation::EscalationMatcher,
    graph::{FunctionSpec, GraphBuilder, ResourceSpec, Scope},
    resource::{SourceContext, Sourcing, ThreadKeyedPool},
    value,
};
use skein_error::generic_error;
use tracing::{info, warn};

pub const MAIN_POOL: &str = "main";
pub const IO_POOL: &str = "io";
pub const ENTRY_POINT: &str = "fetch";

pub const CORPUS: &[&str] = &[
    "the quick brown fox\njumps over the lazy dog",
    "a skein is a length of thread\nloosely coiled and knotted\nready for the loom",
    "no stop words here\nonly counting",
];

const STOP_WORDS: &[&str] = &["a", "and", "for", "is", "of", "the"];

/// Builds the word counting graph.
///
/// Every process starts at `fetch`, with the index of its document as the parameter.
pub fn word_count() -> GraphBuilder {
    GraphBuilder::default()
        // Loaded on a background thread, as if read from disk, once per process.
        .add_resource(
            ResourceSpec::new("corpus", Scope::Process, |ctx: &mut SourceContext<'_>| {
                let listener = ctx.listener();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(5));
                    listener.complete(CORPUS.iter().map(|doc| doc.to_string()).collect::<Vec<_>>());
                });
                Sourcing::Pending
            })
            .with_timeout(Duration::from_secs(1)),
        )
        .add_resource(ResourceSpec::new("stop_words", Scope::Process, |_| {
            Sourcing::ready(STOP_WORDS.iter().map(|word| word.to_string()).collect::<Vec<_>>())
        }))
        .add_resource(ResourceSpec::new("total", Scope::Process, |_| Sourcing::ready(AtomicUsize::new(0))))
        // Scratch space for normalizing words, reused by whichever function next runs on the same worker.
        .add_resource(
            ResourceSpec::new("scratch", Scope::Thread, |_| Sourcing::ready(Mutex::new(String::new())))
                .with_pool(Arc::new(ThreadKeyedPool::new("scratch", 1))),
        )
        .add_function(
            FunctionSpec::new(ENTRY_POINT, IO_POOL, |ctx: &mut FunctionContext<'_>| {
                let index = ctx.parameter_as::<usize>()?;
                let corpus = ctx.dependency::<Vec<String>>(0)?;
                let document = corpus
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| generic_error!("No document at index {}.", index))?;
                Ok(Next::with(document))
            })
            .with_dependency("corpus")
            .with_next("split"),
        )
        .add_function(
            FunctionSpec::new("split", MAIN_POOL, |ctx: &mut FunctionContext<'_>| {
                let document = ctx.parameter_as::<String>()?;
                let total = ctx.dependency::<AtomicUsize>(0)?;
                let process_id = ctx.process_id();

                let lines = document.lines().map(|line| (0, Some(value(line.to_string())))).collect();
                ctx.join(lines, move |failure| match failure {
                    Some(escalation) => Err(generic_error!("Failed to count every line: {}", escalation)),
                    None => {
                        let words = total.load(Ordering::SeqCst);
                        if words == 0 {
                            return Err(generic_error!("Document has no words worth counting."));
                        }
                        info!(process_id = %process_id, words, "Counted document.");
                        Ok(())
                    }
                })?;
                Ok(Next::Stop)
            })
            .with_dependency("total")
            .with_flow("count"),
        )
        .add_function(
            FunctionSpec::new("count", IO_POOL, |ctx: &mut FunctionContext<'_>| {
                let line = ctx.parameter_as::<String>()?;
                let stop_words = ctx.dependency::<Vec<String>>(0)?;
                let total = ctx.dependency::<AtomicUsize>(1)?;
                let scratch = ctx.dependency::<Mutex<String>>(2)?;
                let mut scratch = scratch.lock().map_err(|_| generic_error!("Scratch buffer is poisoned."))?;

                let mut words = 0;
                for word in line.split_whitespace() {
                    scratch.clear();
                    scratch.extend(word.chars().filter(|c| c.is_alphanumeric()).flat_map(char::to_lowercase));
                    if !scratch.is_empty() && !stop_words.iter().any(|stop| stop == scratch.as_str()) {
                        words += 1;
                    }
                }
                total.fetch_add(words, Ordering::SeqCst);
                Ok(Next::Stop)
            })
            .with_dependency("stop_words")
            .with_dependency("total")
            .with_dependency("scratch"),
        )
        .add_function(FunctionSpec::new("report", MAIN_POOL, |ctx: &mut FunctionContext<'_>| {
            if let Some(escalation) = ctx.escalation() {
                warn!(process_id = %ctx.process_id(), escalation = %escalation, "Recovered from escalation.");
            }
            Ok(Next::Stop)
        }))
        .with_escalation_handler(EscalationMatcher::Any, "report")
}
