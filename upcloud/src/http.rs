//! `Api` over HTTPS with basic authentication.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, trace};

use crate::{
    client::Api,
    error::{self, Error},
    types::*,
};

pub const DEFAULT_API_URL: &str = "https://api.upcloud.com/1.3";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct AccountEnvelope {
    account: Account,
}

#[derive(Deserialize)]
struct StoragesEnvelope {
    storages: StorageList,
}

#[derive(Deserialize)]
struct StorageList {
    #[serde(default)]
    storage: Vec<Storage>,
}

#[derive(Serialize, Deserialize)]
struct StorageEnvelope<T> {
    storage: T,
}

#[derive(Deserialize)]
struct ServersEnvelope {
    servers: ServerList,
}

#[derive(Deserialize)]
struct ServerList {
    #[serde(default)]
    server: Vec<Server>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerDetails,
}

#[derive(Serialize)]
struct StorageDeviceEnvelope<'a, T> {
    storage_device: &'a T,
}

#[derive(Deserialize)]
struct ResizeEnvelope {
    resize_backup: ResizeStorageFilesystemBackup,
}

#[derive(Deserialize)]
struct ProblemEnvelope {
    error: ProblemBody,
}

#[derive(Deserialize)]
struct ProblemBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl Client {
    pub fn new(
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("upcloud-csi/", env!("CARGO_PKG_VERSION")))
            .build()
            .context(error::HttpClient)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Perform a request and return the raw body of a successful response.
    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<String, Error> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.username, Some(&self.password))
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.context(error::Request {
            method: method.as_str(),
            path,
        })?;
        let status = response.status();
        let text = response.text().await.context(error::Request {
            method: method.as_str(),
            path,
        })?;
        trace!("{} {} -> {}: {}", method, path, status, text);

        if status.is_success() {
            return Ok(text);
        }

        let (code, message) =
            match serde_json::from_str::<ProblemEnvelope>(&text) {
                Ok(problem) => {
                    (problem.error.error_code, problem.error.error_message)
                }
                Err(_) => (String::new(), text),
            };
        Err(Error::Problem {
            method: method.to_string(),
            path: path.to_string(),
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn call<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, Error> {
        let text = self.execute(method.clone(), path, body).await?;
        serde_json::from_str(&text).context(error::Decode {
            method: method.as_str(),
            path,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.call::<T, ()>(Method::GET, path, None).await
    }
}

#[async_trait]
impl Api for Client {
    async fn get_account(&self) -> Result<Account, Error> {
        let envelope: AccountEnvelope = self.get("/account").await?;
        Ok(envelope.account)
    }

    async fn get_storages(&self) -> Result<Vec<Storage>, Error> {
        let envelope: StoragesEnvelope = self.get("/storage").await?;
        Ok(envelope.storages.storage)
    }

    async fn get_storage_details(
        &self,
        uuid: &str,
    ) -> Result<StorageDetails, Error> {
        let envelope: StorageEnvelope<StorageDetails> =
            self.get(&format!("/storage/{}", uuid)).await?;
        Ok(envelope.storage)
    }

    async fn create_storage(
        &self,
        request: &CreateStorageRequest,
    ) -> Result<StorageDetails, Error> {
        let envelope: StorageEnvelope<StorageDetails> = self
            .call(
                Method::POST,
                "/storage",
                Some(&StorageEnvelope {
                    storage: request,
                }),
            )
            .await?;
        Ok(envelope.storage)
    }

    async fn clone_storage(
        &self,
        uuid: &str,
        request: &CloneStorageRequest,
    ) -> Result<StorageDetails, Error> {
        let envelope: StorageEnvelope<StorageDetails> = self
            .call(
                Method::POST,
                &format!("/storage/{}/clone", uuid),
                Some(&StorageEnvelope {
                    storage: request,
                }),
            )
            .await?;
        Ok(envelope.storage)
    }

    async fn modify_storage(
        &self,
        uuid: &str,
        request: &ModifyStorageRequest,
    ) -> Result<StorageDetails, Error> {
        let envelope: StorageEnvelope<StorageDetails> = self
            .call(
                Method::PUT,
                &format!("/storage/{}", uuid),
                Some(&StorageEnvelope {
                    storage: request,
                }),
            )
            .await?;
        Ok(envelope.storage)
    }

    async fn resize_storage_filesystem(
        &self,
        uuid: &str,
    ) -> Result<ResizeStorageFilesystemBackup, Error> {
        let envelope: ResizeEnvelope = self
            .call::<_, ()>(
                Method::POST,
                &format!("/storage/{}/resize", uuid),
                None,
            )
            .await?;
        Ok(envelope.resize_backup)
    }

    async fn delete_storage(&self, uuid: &str) -> Result<(), Error> {
        self.execute::<()>(
            Method::DELETE,
            &format!("/storage/{}", uuid),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn create_backup(
        &self,
        uuid: &str,
        request: &CreateBackupRequest,
    ) -> Result<StorageDetails, Error> {
        let envelope: StorageEnvelope<StorageDetails> = self
            .call(
                Method::POST,
                &format!("/storage/{}/backup", uuid),
                Some(&StorageEnvelope {
                    storage: request,
                }),
            )
            .await?;
        Ok(envelope.storage)
    }

    async fn get_servers(&self) -> Result<Vec<Server>, Error> {
        let envelope: ServersEnvelope = self.get("/server").await?;
        Ok(envelope.servers.server)
    }

    async fn get_server_details(
        &self,
        uuid: &str,
    ) -> Result<ServerDetails, Error> {
        let envelope: ServerEnvelope =
            self.get(&format!("/server/{}", uuid)).await?;
        Ok(envelope.server)
    }

    async fn attach_storage(
        &self,
        server_uuid: &str,
        request: &AttachStorageRequest,
    ) -> Result<ServerDetails, Error> {
        let envelope: ServerEnvelope = self
            .call(
                Method::POST,
                &format!("/server/{}/storage/attach", server_uuid),
                Some(&StorageDeviceEnvelope {
                    storage_device: request,
                }),
            )
            .await?;
        Ok(envelope.server)
    }

    async fn detach_storage(
        &self,
        server_uuid: &str,
        request: &DetachStorageRequest,
    ) -> Result<ServerDetails, Error> {
        let envelope: ServerEnvelope = self
            .call(
                Method::POST,
                &format!("/server/{}/storage/detach", server_uuid),
                Some(&StorageDeviceEnvelope {
                    storage_device: request,
                }),
            )
            .await?;
        Ok(envelope.server)
    }
}
