//! Pipeline dispatcher: the single point of concurrency.
//!
//! Files are processed sequentially in reader order. Within a file, batches
//! flow through a bounded job queue into a worker pool (prompt → gate → LLM
//! → decode with bounded, classified retries) and results converge on a
//! single commit gate that releases them strictly in batch order. The commit
//! gate feeds two byte pipes, one per artifact: the reassembled primary
//! stream and the JSONL parallel-corpus sidecar. Each pipe is drained by one
//! writer task invoked exactly once per artifact.
//!
//! Back-pressure: job, result and pipe channels are all bounded at
//! `2 × concurrency`. Out-of-order completions buffer at most
//! `concurrency - 1` batches at the commit gate. First error cancels the
//! file's token; everything in flight drains without further commits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::estimate::{TokenEstimator, effective_budget};
use crate::pipeline::fragment::{
    Batch, DST_TEXT_META_KEY, FileId, IndexMetaMap, Meta, Record, SRC_TEXT_META_KEY, SpanResult,
};
use crate::services::context::{
    Assembler, BatchLimit, ByteStream, Components, Decoder, LlmClient, PromptBuilder, Settings,
    empty_byte_stream,
};
use crate::services::gate::{Ask, LimitKey, RateGate};
use crate::services::metrics;
use crate::services::progress::ProgressSink;

const RETRY_PAUSE: Duration = Duration::from_millis(200);

/// Runs the full pipeline over every input file. Returns the first error
/// encountered; artifacts committed before that error stay on disk.
pub async fn run(
    ctx: &CancellationToken,
    components: &Components,
    settings: &Settings,
    progress: Arc<dyn ProgressSink>,
) -> PipelineResult<()> {
    if settings.inputs.is_empty() {
        return Err(PipelineError::invalid("no inputs configured"));
    }
    let concurrency = settings.concurrency.max(1);

    let estimator = TokenEstimator::new(settings.bytes_per_token);
    let overhead = components.prompt_builder.estimate_overhead_tokens(&estimator);
    let Some(effective_max) = effective_budget(settings.max_tokens, overhead) else {
        return Err(PipelineError::budget(format!(
            "prompt overhead of {overhead} tokens consumes the budget of {}",
            settings.max_tokens
        )));
    };
    tracing::debug!(
        max_tokens = settings.max_tokens,
        overhead,
        effective_max,
        concurrency,
        "pipeline budget resolved"
    );

    let run_ctx = ctx.child_token();
    let mut files = components.reader.iterate(&run_ctx, &settings.inputs).await?;
    while let Some(item) = files.next().await {
        let (file_id, data) = item?;
        let split_started = Instant::now();
        let records = match components.splitter.split(&run_ctx, &file_id, data).await {
            Ok(records) => records,
            Err(err) => {
                report_error("splitter", &file_id, None, &err);
                return Err(err);
            }
        };
        tracing::debug!(
            file_id = %file_id,
            records = records.len(),
            duration_ms = split_started.elapsed().as_millis() as u64,
            "file split"
        );
        metrics::inc_op("splitter", "finish");

        if records.is_empty() {
            progress.file_start(&file_id, 0);
            let started = Instant::now();
            let result = write_empty_artifacts(&run_ctx, components, &file_id).await;
            progress.file_finish(result.is_ok(), started.elapsed());
            result?;
            continue;
        }

        process_file(
            &run_ctx,
            components,
            settings,
            Arc::clone(&progress),
            file_id,
            records,
            effective_max,
            concurrency,
        )
        .await?;
    }
    Ok(())
}

/// Empty input still produces both artifacts, each empty.
async fn write_empty_artifacts(
    ctx: &CancellationToken,
    components: &Components,
    file_id: &FileId,
) -> PipelineResult<()> {
    let stream = components
        .assembler
        .assemble(file_id, &[])
        .inspect_err(|err| report_error("assembler", file_id, None, err))?;
    components
        .writer
        .write(ctx, file_id, stream)
        .await
        .inspect_err(|err| report_error("writer", file_id, None, err))?;
    components
        .writer
        .write(ctx, &file_id.sidecar(), empty_byte_stream())
        .await
        .inspect_err(|err| report_error("writer", file_id, None, err))?;
    metrics::inc_op("writer", "finish");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn process_file(
    run_ctx: &CancellationToken,
    components: &Components,
    settings: &Settings,
    progress: Arc<dyn ProgressSink>,
    file_id: FileId,
    records: Vec<Record>,
    effective_max: usize,
    concurrency: usize,
) -> PipelineResult<()> {
    let records: Arc<[Record]> = records.into();
    let batches = components
        .batcher
        .make(Arc::clone(&records), BatchLimit { max_tokens: effective_max })
        .inspect_err(|err| report_error("batcher", &file_id, None, err))?;
    metrics::inc_op("batcher", "finish");

    let total = batches.len();
    progress.file_start(&file_id, total);
    let started = Instant::now();
    if batches.is_empty() {
        let result = write_empty_artifacts(run_ctx, components, &file_id).await;
        progress.file_finish(result.is_ok(), started.elapsed());
        return result;
    }

    let file_ctx = run_ctx.child_token();
    let batches: Arc<[Batch]> = batches.into();
    let capacity = concurrency * 2;

    // One writer task per artifact, each fed by a bounded byte pipe.
    let (primary_pipe, primary_stream) = byte_pipe(capacity);
    let (sidecar_pipe, sidecar_stream) = byte_pipe(capacity);
    let primary_task = spawn_writer(components, &file_ctx, file_id.clone(), primary_stream);
    let sidecar_task = spawn_writer(components, &file_ctx, file_id.sidecar(), sidecar_stream);

    let (job_tx, job_rx) = flume::bounded::<Batch>(capacity);
    let (result_tx, mut result_rx) = mpsc::channel::<BatchOutcome>(capacity);

    let producer = {
        let ctx = file_ctx.clone();
        let batches = Arc::clone(&batches);
        tokio::spawn(async move {
            for batch in batches.iter() {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    sent = job_tx.send_async(batch.clone()) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    };

    let mut workers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        workers.push(spawn_worker(
            file_ctx.clone(),
            job_rx.clone(),
            result_tx.clone(),
            components,
            settings,
        ));
    }
    // The commit loop ends when every worker has dropped its sender.
    drop(result_tx);
    drop(job_rx);

    let mut expect: i64 = 0;
    let mut buffer: HashMap<i64, Vec<SpanResult>> = HashMap::new();
    let mut first_err: Option<PipelineError> = None;
    let mut pipe_closed = false;
    let mut done = 0usize;
    let mut errors = 0usize;

    while let Some(outcome) = result_rx.recv().await {
        done += 1;
        if outcome.result.is_err() {
            errors += 1;
        }
        progress.file_progress(done, total, errors);
        match outcome.result {
            Err(err) => {
                if first_err.is_none() {
                    file_ctx.cancel();
                    first_err = Some(err);
                } else {
                    tracing::debug!(
                        file_id = %file_id,
                        batch = outcome.batch_index,
                        error = %err,
                        "secondary failure after first error"
                    );
                }
            }
            Ok(spans) => {
                if first_err.is_some() || pipe_closed {
                    continue;
                }
                buffer.insert(outcome.batch_index, spans);
                while let Some(spans) = buffer.remove(&expect) {
                    match commit_batch(
                        components.assembler.as_ref(),
                        &file_id,
                        &batches[expect as usize],
                        &spans,
                        &primary_pipe,
                        &sidecar_pipe,
                    )
                    .await
                    {
                        Ok(()) => expect += 1,
                        Err(CommitFailure::Internal(err)) => {
                            report_error("assembler", &file_id, Some(expect), &err);
                            file_ctx.cancel();
                            first_err = Some(err);
                            break;
                        }
                        Err(CommitFailure::PipeClosed) => {
                            // Writer ended early; its join result carries the
                            // real error, so only stop committing here.
                            file_ctx.cancel();
                            pipe_closed = true;
                            break;
                        }
                    }
                }
            }
        }
    }

    for worker in workers {
        let _ = worker.await;
    }
    let _ = producer.await;

    match &first_err {
        Some(err) => {
            primary_pipe.close_with_error(err.stream_abort()).await;
            sidecar_pipe.close_with_error(err.stream_abort()).await;
        }
        None => {
            drop(primary_pipe);
            drop(sidecar_pipe);
        }
    }
    let primary_result = join_writer(primary_task).await;
    let sidecar_result = join_writer(sidecar_task).await;

    let result = if let Some(err) = first_err {
        Err(err)
    } else if let Err(err) = primary_result {
        report_error("writer", &file_id, None, &err);
        Err(err)
    } else if let Err(err) = sidecar_result {
        report_error("writer", &file_id, None, &err);
        Err(err)
    } else if pipe_closed {
        Err(PipelineError::Invariant(
            "artifact pipe closed without a writer error".to_string(),
        ))
    } else {
        metrics::inc_op("writer", "finish");
        Ok(())
    };
    progress.file_finish(result.is_ok(), started.elapsed());
    result
}

struct BatchOutcome {
    batch_index: i64,
    result: PipelineResult<Vec<SpanResult>>,
}

fn spawn_worker(
    ctx: CancellationToken,
    jobs: flume::Receiver<Batch>,
    results: mpsc::Sender<BatchOutcome>,
    components: &Components,
    settings: &Settings,
) -> JoinHandle<()> {
    let prompt_builder = Arc::clone(&components.prompt_builder);
    let llm = Arc::clone(&components.llm);
    let decoder = Arc::clone(&components.decoder);
    let gate = settings.gate.clone();
    let gate_key = settings.gate_key.clone();
    let estimator = TokenEstimator::new(settings.bytes_per_token);
    let attempts = settings.max_retries + 1;

    tokio::spawn(async move {
        while let Ok(batch) = jobs.recv_async().await {
            let result = process_batch(
                &ctx,
                &batch,
                prompt_builder.as_ref(),
                llm.as_ref(),
                decoder.as_ref(),
                gate.as_deref(),
                &gate_key,
                &estimator,
                attempts,
            )
            .await;
            let outcome = BatchOutcome { batch_index: batch.batch_index, result };
            if results.send(outcome).await.is_err() {
                return;
            }
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn process_batch(
    ctx: &CancellationToken,
    batch: &Batch,
    prompt_builder: &dyn PromptBuilder,
    llm: &dyn LlmClient,
    decoder: &dyn Decoder,
    gate: Option<&RateGate>,
    gate_key: &LimitKey,
    estimator: &TokenEstimator,
    attempts: usize,
) -> PipelineResult<Vec<SpanResult>> {
    // Jobs already queued when cancellation lands are drained without
    // touching the LLM.
    if ctx.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let prompt = prompt_builder.build(batch).inspect_err(|err| {
        report_error("prompt_builder", &batch.file_id, Some(batch.batch_index), err);
    })?;
    // The gate sees the realized prompt size, not the batcher's estimate.
    let tokens = estimator.estimate_bytes(prompt.content_bytes());
    let target = batch.target();
    let index_meta = build_index_meta(batch);

    let mut last_err: Option<PipelineError> = None;
    for attempt in 1..=attempts {
        if let Some(gate) = gate {
            let ask = Ask { key: gate_key, requests: 1, tokens };
            if let Err(err) = gate.wait(ctx, &ask).await {
                report_error("gate", &batch.file_id, Some(batch.batch_index), &err);
                return Err(err);
            }
        }

        let invoke_started = Instant::now();
        let raw = match llm.invoke(ctx, batch, &prompt).await {
            Ok(raw) => raw,
            Err(err) => {
                log_invoke_error(batch, attempt, &err);
                let retry = attempt < attempts && err.retry_invoke();
                last_err = Some(err);
                if retry {
                    retry_pause(ctx).await?;
                    continue;
                }
                break;
            }
        };
        tracing::debug!(
            file_id = %batch.file_id,
            batch = batch.batch_index,
            attempt,
            tokens,
            duration_ms = invoke_started.elapsed().as_millis() as u64,
            "llm invocation finished"
        );
        metrics::inc_op("llm_client", "finish");

        match decoder.decode_with_meta(&target, &raw, &index_meta) {
            Ok(spans) => {
                metrics::inc_op("decoder", "finish");
                return Ok(spans);
            }
            Err(err) => {
                report_error("decoder", &batch.file_id, Some(batch.batch_index), &err);
                let retry = attempt < attempts && err.retry_decode();
                last_err = Some(err);
                if retry {
                    retry_pause(ctx).await?;
                    continue;
                }
                break;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        PipelineError::Invariant("batch failed without a recorded error".to_string())
    }))
}

/// Read-only index→meta view of the batch window, with the source text
/// injected for decoder-side protocol checks.
fn build_index_meta(batch: &Batch) -> IndexMetaMap {
    batch
        .records()
        .iter()
        .map(|record| {
            let mut meta: Meta = record.meta.clone().unwrap_or_default();
            meta.insert(SRC_TEXT_META_KEY.to_string(), record.text.clone());
            (record.index, meta)
        })
        .collect()
}

enum CommitFailure {
    Internal(PipelineError),
    PipeClosed,
}

#[derive(Serialize)]
struct SidecarRow<'a> {
    file_id: &'a str,
    from: i64,
    to: i64,
    src: &'a str,
    dst: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<&'a Meta>,
}

/// Flushes one batch in commit order: sidecar rows first, then the
/// assembled primary bytes.
async fn commit_batch(
    assembler: &dyn Assembler,
    file_id: &FileId,
    batch: &Batch,
    spans: &[SpanResult],
    primary: &BytePipe,
    sidecar: &BytePipe,
) -> Result<(), CommitFailure> {
    let records = batch.records();
    let mut pos = 0usize;
    for span in spans {
        while pos < records.len() && records[pos].index < span.from {
            pos += 1;
        }
        let mut src = String::new();
        let mut cursor = pos;
        while cursor < records.len() && records[cursor].index <= span.to {
            if cursor > pos {
                src.push('\n');
            }
            src.push_str(&records[cursor].text);
            cursor += 1;
        }
        let dst = span
            .meta
            .as_ref()
            .and_then(|meta| meta.get(DST_TEXT_META_KEY))
            .filter(|text| !text.trim().is_empty())
            .map(String::as_str)
            .unwrap_or(&span.output);
        let row = SidecarRow {
            file_id: file_id.as_str(),
            from: span.from,
            to: span.to,
            src: &src,
            dst,
            meta: span.meta.as_ref(),
        };
        let mut line = serde_json::to_string(&row).map_err(|err| {
            CommitFailure::Internal(PipelineError::Invariant(format!("sidecar row: {err}")))
        })?;
        line.push('\n');
        if !sidecar.send(Bytes::from(line)).await {
            return Err(CommitFailure::PipeClosed);
        }
    }

    let mut assembled = assembler
        .assemble(file_id, spans)
        .map_err(CommitFailure::Internal)?;
    metrics::inc_op("assembler", "finish");
    while let Some(chunk) = assembled.next().await {
        let chunk = chunk.map_err(CommitFailure::Internal)?;
        if !primary.send(chunk).await {
            return Err(CommitFailure::PipeClosed);
        }
    }
    Ok(())
}

struct BytePipe {
    tx: mpsc::Sender<Result<Bytes, PipelineError>>,
}

impl BytePipe {
    async fn send(&self, bytes: Bytes) -> bool {
        self.tx.send(Ok(bytes)).await.is_ok()
    }

    async fn close_with_error(self, err: PipelineError) {
        let _ = self.tx.send(Err(err)).await;
    }
}

fn byte_pipe(capacity: usize) -> (BytePipe, ByteStream) {
    let (tx, rx) = mpsc::channel::<Result<Bytes, PipelineError>>(capacity);
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (BytePipe { tx }, Box::pin(stream))
}

fn spawn_writer(
    components: &Components,
    ctx: &CancellationToken,
    id: FileId,
    data: ByteStream,
) -> JoinHandle<PipelineResult<()>> {
    let writer = Arc::clone(&components.writer);
    let ctx = ctx.clone();
    tokio::spawn(async move { writer.write(&ctx, &id, data).await })
}

async fn join_writer(task: JoinHandle<PipelineResult<()>>) -> PipelineResult<()> {
    match task.await {
        Ok(result) => result,
        Err(err) => Err(PipelineError::Invariant(format!("writer task failed: {err}"))),
    }
}

async fn retry_pause(ctx: &CancellationToken) -> PipelineResult<()> {
    tokio::select! {
        _ = ctx.cancelled() => Err(PipelineError::Cancelled),
        _ = tokio::time::sleep(RETRY_PAUSE) => Ok(()),
    }
}

fn log_invoke_error(batch: &Batch, attempt: usize, err: &PipelineError) {
    if let PipelineError::Upstream { status, message } = err {
        let mut message = message.clone();
        message.truncate(200);
        tracing::error!(
            component = "llm_client",
            code = err.code().as_ref(),
            file_id = %batch.file_id,
            batch = batch.batch_index,
            attempt,
            http_status = status,
            upstream_msg = %message,
            "invoke failed"
        );
    } else {
        tracing::error!(
            component = "llm_client",
            code = err.code().as_ref(),
            file_id = %batch.file_id,
            batch = batch.batch_index,
            attempt,
            "invoke failed"
        );
    }
    metrics::inc_op("llm_client", "error");
    metrics::inc_error("llm_client", err.code());
}

fn report_error(component: &str, file_id: &FileId, batch: Option<i64>, err: &PipelineError) {
    tracing::error!(
        component,
        code = err.code().as_ref(),
        file_id = %file_id,
        batch = batch.unwrap_or(-1),
        error = %err,
        "stage failed"
    );
    metrics::inc_op(component, "error");
    metrics::inc_error(component, err.code());
}
