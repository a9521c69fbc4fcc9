use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::{Parallelism, ValidationContext, ValidationPlugin};
use crate::{error::Error, script::{substitute, ScriptRunner}};

const DEFAULT_HTTP_PORT: u16 = 80;

struct RunningServer {
    address: SocketAddr,
    handle: JoinHandle<()>,
    stop: Sender<()>,
}

/// Answers http-01 challenges from an embedded web server.
///
/// The server is started on commit, serving every challenge prepared for the group,
/// and stopped on cleanup.
pub struct SelfHosting {
    port: u16,
    files: Arc<DashMap<String, String>>,
    server: Mutex<Option<RunningServer>>,
}

impl SelfHosting {
    pub fn new(port: Option<u16>) -> Self {
        Self {
            port: port.unwrap_or(DEFAULT_HTTP_PORT),
            files: Arc::new(DashMap::new()),
            server: Mutex::new(None),
        }
    }

    /// Where the server listens, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|server| server.address)
    }
}

#[async_trait]
impl ValidationPlugin for SelfHosting {
    fn parallelism(&self) -> Parallelism {
        Parallelism::PrepareAndAnswer
    }

    async fn prepare_challenge(&self, context: &ValidationContext) -> Result<(), Error> {
        debug!("Serving {} for {}", context.http_path(), context.identifier);
        self.files
            .insert(context.http_path(), context.http_content().to_owned());
        Ok(())
    }

    async fn commit(&self) -> Result<(), Error> {
        let mut running = self.server.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let files = Arc::clone(&self.files);
        let server = rouille::Server::new(("0.0.0.0", self.port), move |request| {
            match files.get(&request.url()) {
                Some(content) => rouille::Response::text(content.value().clone()),
                None => rouille::Response::empty_404(),
            }
        })
        .map_err(|e| {
            Error::FromIoError(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("cannot listen on port {}: {}", self.port, e),
            ))
        })?;
        let address = server.server_addr();
        let (handle, stop) = server.stoppable();
        info!("Listening for http-01 validation on {}", address);
        *running = Some(RunningServer {
            address,
            handle,
            stop,
        });
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        self.files.clear();
        let running = self.server.lock().await.take();
        if let Some(server) = running {
            if server.stop.send(()).is_err() {
                debug!("Validation server on {} already stopped", server.address);
            }
            let handle = server.handle;
            if let Ok(Err(_)) = tokio::task::spawn_blocking(move || handle.join()).await {
                warn!("Validation server on {} panicked", server.address);
            }
        }
        Ok(())
    }
}

/// Answers http-01 challenges with files under the web root of an existing server.
pub struct FileSystem {
    web_root: PathBuf,
    written: Mutex<Vec<PathBuf>>,
}

impl FileSystem {
    pub fn new(web_root: PathBuf) -> Self {
        Self {
            web_root,
            written: Mutex::new(Vec::new()),
        }
    }

    fn file_for(&self, context: &ValidationContext) -> PathBuf {
        self.web_root
            .join(context.http_path().trim_start_matches('/'))
    }
}

#[async_trait]
impl ValidationPlugin for FileSystem {
    fn parallelism(&self) -> Parallelism {
        Parallelism::PrepareAndAnswer
    }

    fn disabled(&self) -> Option<String> {
        if self.web_root.is_dir() {
            None
        } else {
            Some(format!("web root {} does not exist", self.web_root.display()))
        }
    }

    async fn prepare_challenge(&self, context: &ValidationContext) -> Result<(), Error> {
        let path = self.file_for(context);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, context.http_content()).await?;
        debug!("Wrote {} for {}", path.display(), context.identifier);
        self.written.lock().await.push(path);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        let written = std::mem::take(&mut *self.written.lock().await);
        for path in written {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
            }
        }
        Ok(())
    }
}

const DEFAULT_CREATE_ARGUMENTS: &str = "create {Identifier} {RecordName} {Token}";
const DEFAULT_DELETE_ARGUMENTS: &str = "delete {Identifier} {RecordName} {Token}";

/// Answers dns-01 challenges through user scripts that create and delete the TXT records.
pub struct Script {
    runner: ScriptRunner,
    create_script: String,
    create_arguments: Option<String>,
    delete_script: Option<String>,
    delete_arguments: Option<String>,
    created: Mutex<Vec<ValidationContext>>,
}

impl Script {
    pub fn new(
        runner: ScriptRunner,
        create_script: String,
        create_arguments: Option<String>,
        delete_script: Option<String>,
        delete_arguments: Option<String>,
    ) -> Self {
        Self {
            runner,
            create_script,
            create_arguments,
            delete_script,
            delete_arguments,
            created: Mutex::new(Vec::new()),
        }
    }

    fn arguments(template: &str, context: &ValidationContext) -> String {
        let record_name = context.dns_record_name();
        let token = context.dns_record_value();
        substitute(
            template,
            &[
                ("Identifier", context.identifier.trim_start_matches("*.")),
                ("RecordName", record_name.as_str()),
                ("Token", token.as_str()),
            ],
        )
    }
}

#[async_trait]
impl ValidationPlugin for Script {
    async fn prepare_challenge(&self, context: &ValidationContext) -> Result<(), Error> {
        let template = self
            .create_arguments
            .as_deref()
            .unwrap_or(DEFAULT_CREATE_ARGUMENTS);
        self.runner
            .run(&self.create_script, Some(Self::arguments(template, context).as_str()))
            .await?;
        self.created.lock().await.push(context.clone());
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Error> {
        let created = std::mem::take(&mut *self.created.lock().await);
        let script = match &self.delete_script {
            Some(script) => script,
            None => return Ok(()),
        };
        let template = self
            .delete_arguments
            .as_deref()
            .unwrap_or(DEFAULT_DELETE_ARGUMENTS);
        for context in created {
            if let Err(e) = self
                .runner
                .run(script, Some(Self::arguments(template, &context).as_str()))
                .await
            {
                warn!("Unable to delete {}: {}", context.dns_record_name(), e);
            }
        }
        Ok(())
    }
}
