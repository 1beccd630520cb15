//! The worker side of the pool protocol.
//!
//! [`WorkerServer::serve`] reads requests line by line, runs the model on a
//! blocking thread, and writes one response per request. The same server backs
//! the `docsearch-embed-worker` binary (stdin/stdout) and in-process workers
//! (an in-memory duplex pipe).
//!
//! A panic inside the model ends `serve` with an error. To the pool that looks
//! exactly like a crashed process: the channel closes.
use crate::config::EmbedConfig;
use crate::error::Result;
use crate::model::{EmbedRole, EmbeddingModel, load_model, normalize_l2};
use crate::protocol::{WorkerRequest, WorkerResponse, decode_line, encode_line};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Builds the model a worker serves. Swappable for tests.
pub type ModelFactory = Arc<dyn Fn(&EmbedConfig) -> Result<Box<dyn EmbeddingModel>> + Send + Sync>;

pub fn default_model_factory() -> ModelFactory {
    Arc::new(load_model)
}

/// Resident memory of the current process, in bytes.
pub fn current_process_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    process_memory(pid.as_u32())
}

/// Resident memory of process `pid`, in bytes.
pub fn process_memory(pid: u32) -> Option<u64> {
    let pid = sysinfo::Pid::from_u32(pid);
    let mut system = sysinfo::System::new();
    system.refresh_process(pid);
    system.process(pid).map(|p| p.memory())
}

struct LoadedModel {
    model: Box<dyn EmbeddingModel>,
    config: EmbedConfig,
}

#[derive(Clone)]
pub struct WorkerServer {
    factory: ModelFactory,
    report_memory: bool,
}

impl Default for WorkerServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerServer {
    pub fn new() -> Self {
        Self {
            factory: default_model_factory(),
            report_memory: false,
        }
    }

    pub fn with_factory(mut self, factory: ModelFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Include this process's resident memory in `pong` responses. Only
    /// meaningful when the worker owns its process.
    pub fn with_memory_reporting(mut self, enabled: bool) -> Self {
        self.report_memory = enabled;
        self
    }

    /// Serve requests until `shutdown`, end of input, or a fatal model fault.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut loaded: Option<LoadedModel> = None;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request = match decode_line::<WorkerRequest>(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Discarding malformed request: {}", e);
                    write_response(
                        &mut writer,
                        &WorkerResponse::Error {
                            correlation_id: None,
                            message: e.to_string(),
                        },
                    )
                    .await?;
                    continue;
                }
            };

            let response = match request {
                WorkerRequest::Init { config } => self.handle_init(config, &mut loaded).await?,
                WorkerRequest::Embed {
                    correlation_id,
                    texts,
                    role,
                } => handle_embed(correlation_id, texts, role, &mut loaded).await?,
                WorkerRequest::Ping { correlation_id } => WorkerResponse::Pong {
                    correlation_id,
                    memory_bytes: self
                        .report_memory
                        .then(current_process_memory)
                        .flatten(),
                },
                WorkerRequest::Shutdown => {
                    info!("Embedding worker shutting down");
                    write_response(&mut writer, &WorkerResponse::ShuttingDown).await?;
                    return Ok(());
                }
            };
            write_response(&mut writer, &response).await?;
        }

        debug!("Worker input closed");
        Ok(())
    }

    async fn handle_init(
        &self,
        config: EmbedConfig,
        loaded: &mut Option<LoadedModel>,
    ) -> Result<WorkerResponse> {
        let factory = Arc::clone(&self.factory);
        let init_config = config.clone();
        let result = tokio::task::spawn_blocking(move || factory(&init_config)).await?;

        Ok(match result {
            Ok(model) => {
                let response = WorkerResponse::Ready {
                    model: model.name().to_string(),
                    dimension: model.dimension(),
                };
                info!(
                    "Embedding worker ready: {} (dimension {})",
                    model.name(),
                    model.dimension()
                );
                *loaded = Some(LoadedModel { model, config });
                response
            }
            Err(e) => {
                warn!("Model initialization failed: {}", e);
                WorkerResponse::Error {
                    correlation_id: None,
                    message: e.to_string(),
                }
            }
        })
    }
}

async fn handle_embed(
    correlation_id: u64,
    texts: Vec<String>,
    role: EmbedRole,
    loaded: &mut Option<LoadedModel>,
) -> Result<WorkerResponse> {
    let Some(LoadedModel { mut model, config }) = loaded.take() else {
        return Ok(WorkerResponse::Error {
            correlation_id: Some(correlation_id),
            message: "worker received embed before init".to_string(),
        });
    };

    debug!("Embedding {} texts ({:?})", texts.len(), role);
    let batch_size = config.effective_batch_size();
    let normalize = config.normalize;
    // A panic here surfaces as a JoinError and ends the worker.
    let (model, result) = tokio::task::spawn_blocking(move || {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            match model.embed(batch, role) {
                Ok(batch_vectors) => vectors.extend(batch_vectors),
                Err(e) => return (model, Err(e)),
            }
        }
        if normalize {
            vectors.iter_mut().for_each(|v| normalize_l2(v));
        }
        (model, Ok(vectors))
    })
    .await?;
    *loaded = Some(LoadedModel { model, config });

    Ok(match result {
        Ok(vectors) => WorkerResponse::Vectors {
            correlation_id,
            vectors,
        },
        Err(e) => WorkerResponse::Error {
            correlation_id: Some(correlation_id),
            message: e.to_string(),
        },
    })
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &WorkerResponse) -> Result<()> {
    let line = encode_line(response)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

impl std::fmt::Debug for WorkerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerServer")
            .field("report_memory", &self.report_memory)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbedError;
    use crate::model::HashingModel;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn run_session(server: WorkerServer, requests: &[WorkerRequest]) -> Vec<WorkerResponse> {
        let mut input = String::new();
        for request in requests {
            input.push_str(&encode_line(request).unwrap());
        }
        let (mut client, server_side) = tokio::io::duplex(1 << 20);
        let (read_half, write_half) = tokio::io::split(server_side);

        let handle = tokio::spawn(async move { server.serve(BufReader::new(read_half), write_half).await });
        tokio::io::AsyncWriteExt::write_all(&mut client, input.as_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::shutdown(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        output.lines().map(|l| decode_line(l).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_init_embed_shutdown_session() {
        let responses = run_session(
            WorkerServer::new(),
            &[
                WorkerRequest::Init {
                    config: EmbedConfig::hashing(16),
                },
                WorkerRequest::Embed {
                    correlation_id: 1,
                    texts: vec!["alpha beta".into(), "gamma".into()],
                    role: EmbedRole::Passage,
                },
                WorkerRequest::Ping { correlation_id: 2 },
                WorkerRequest::Shutdown,
            ],
        )
        .await;

        assert_eq!(
            responses[0],
            WorkerResponse::Ready {
                model: "hashing-16".into(),
                dimension: 16
            }
        );
        match &responses[1] {
            WorkerResponse::Vectors {
                correlation_id,
                vectors,
            } => {
                assert_eq!(*correlation_id, 1);
                assert_eq!(vectors.len(), 2);
                let expected = HashingModel::new(16).embed_one("alpha beta");
                assert!(vectors[0].iter().zip(&expected).all(|(a, b)| (a - b).abs() < 1e-5));
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(
            responses[2],
            WorkerResponse::Pong {
                correlation_id: 2,
                memory_bytes: None
            }
        );
        assert_eq!(responses[3], WorkerResponse::ShuttingDown);
    }

    #[tokio::test]
    async fn test_embed_before_init_is_an_error() {
        let responses = run_session(
            WorkerServer::new(),
            &[WorkerRequest::Embed {
                correlation_id: 9,
                texts: vec!["x".into()],
                role: EmbedRole::Query,
            }],
        )
        .await;

        assert!(matches!(
            &responses[0],
            WorkerResponse::Error {
                correlation_id: Some(9),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_init_reports_error() {
        let server = WorkerServer::new().with_factory(Arc::new(|_| {
            Err(EmbedError::ModelInitialization {
                message: "no weights".to_string(),
            })
        }));
        let responses = run_session(
            server,
            &[WorkerRequest::Init {
                config: EmbedConfig::hashing(4),
            }],
        )
        .await;

        match &responses[0] {
            WorkerResponse::Error { message, .. } => assert!(message.contains("no weights")),
            other => panic!("unexpected response {other:?}"),
        }
    }
}
