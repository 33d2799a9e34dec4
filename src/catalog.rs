use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{
    DataSetCode, ExperimentIdentifier, NewDataSet, SampleIdentifier, StatusUpdate, StoredDataSet,
};
use crate::error::DropstoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub identifier: ExperimentIdentifier,
    #[serde(default)]
    pub registrator_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub identifier: SampleIdentifier,
    #[serde(default)]
    pub experiment: Option<ExperimentInfo>,
}

/// The metadata service the data store registers with and reports archiving state to.
pub trait CatalogService: Send + Sync {
    fn create_data_set_code(&self) -> Result<DataSetCode, DropstoreError>;
    fn get_sample(&self, identifier: &SampleIdentifier) -> Result<Option<SampleInfo>, DropstoreError>;
    fn get_experiment(
        &self,
        identifier: &ExperimentIdentifier,
    ) -> Result<Option<ExperimentInfo>, DropstoreError>;
    fn register_data_set(&self, data_set: &NewDataSet) -> Result<(), DropstoreError>;
    fn update_archiving_status(&self, update: &StatusUpdate) -> Result<(), DropstoreError>;
    fn update_data_set_size(&self, code: &DataSetCode, size: u64) -> Result<(), DropstoreError>;
    fn notify_data_set_access(&self, code: &DataSetCode) -> Result<(), DropstoreError>;
    fn list_data_sets(&self, codes: &[DataSetCode]) -> Result<Vec<StoredDataSet>, DropstoreError>;
    fn archive_data_sets(
        &self,
        codes: &[DataSetCode],
        remove_from_store: bool,
        options: &BTreeMap<String, String>,
    ) -> Result<(), DropstoreError>;
}

#[derive(Clone)]
pub struct HttpCatalogClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CodeResponse {
    code: DataSetCode,
}

#[derive(Serialize)]
struct SizeRequest {
    size: u64,
}

#[derive(Serialize)]
struct ArchiveRequest<'a> {
    codes: &'a [DataSetCode],
    remove_from_store: bool,
    options: &'a BTreeMap<String, String>,
}

impl HttpCatalogClient {
    pub fn new(base_url: &str) -> Result<Self, DropstoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dropstore/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DropstoreError::Configuration(err.to_string()))?,
        );
        if let Ok(token) = std::env::var("DROPSTORE_CATALOG_TOKEN")
            && !token.trim().is_empty()
        {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                    .map_err(|err| DropstoreError::Configuration(err.to_string()))?,
            );
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| DropstoreError::CatalogHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, DropstoreError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(DropstoreError::CatalogHttp(err.to_string()));
                }
            }
        }
    }

    fn expect_success(response: Response) -> Result<Response, DropstoreError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(DropstoreError::CatalogStatus { status, message })
    }

    fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, DropstoreError> {
        Self::expect_success(response)?
            .json::<T>()
            .map_err(|err| DropstoreError::CatalogHttp(err.to_string()))
    }

    fn read_optional_json<T: DeserializeOwned>(
        response: Response,
    ) -> Result<Option<T>, DropstoreError> {
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read_json(response).map(Some)
    }
}

impl CatalogService for HttpCatalogClient {
    fn create_data_set_code(&self) -> Result<DataSetCode, DropstoreError> {
        let url = self.url("data-set-codes");
        let response = self.send_with_retries(|| self.client.post(&url))?;
        Self::read_json::<CodeResponse>(response).map(|body| body.code)
    }

    fn get_sample(&self, identifier: &SampleIdentifier) -> Result<Option<SampleInfo>, DropstoreError> {
        let url = self.url("samples");
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("identifier", identifier.as_str())])
        })?;
        Self::read_optional_json(response)
    }

    fn get_experiment(
        &self,
        identifier: &ExperimentIdentifier,
    ) -> Result<Option<ExperimentInfo>, DropstoreError> {
        let url = self.url("experiments");
        let identifier = identifier.to_string();
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .query(&[("identifier", identifier.as_str())])
        })?;
        Self::read_optional_json(response)
    }

    fn register_data_set(&self, data_set: &NewDataSet) -> Result<(), DropstoreError> {
        let url = self.url("data-sets");
        let response = self.send_with_retries(|| self.client.post(&url).json(data_set))?;
        Self::expect_success(response).map(|_| ())
    }

    fn update_archiving_status(&self, update: &StatusUpdate) -> Result<(), DropstoreError> {
        let url = self.url("data-sets/archiving-status");
        let response = self.send_with_retries(|| self.client.post(&url).json(update))?;
        Self::expect_success(response).map(|_| ())
    }

    fn update_data_set_size(&self, code: &DataSetCode, size: u64) -> Result<(), DropstoreError> {
        let url = self.url(&format!("data-sets/{code}/size"));
        let body = SizeRequest { size };
        let response = self.send_with_retries(|| self.client.put(&url).json(&body))?;
        Self::expect_success(response).map(|_| ())
    }

    fn notify_data_set_access(&self, code: &DataSetCode) -> Result<(), DropstoreError> {
        let url = self.url(&format!("data-sets/{code}/access"));
        let response = self.send_with_retries(|| self.client.post(&url))?;
        Self::expect_success(response).map(|_| ())
    }

    fn list_data_sets(&self, codes: &[DataSetCode]) -> Result<Vec<StoredDataSet>, DropstoreError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url("data-sets");
        let joined = codes
            .iter()
            .map(DataSetCode::as_str)
            .collect::<Vec<_>>()
            .join(",");
        let response =
            self.send_with_retries(|| self.client.get(&url).query(&[("codes", joined.as_str())]))?;
        Self::read_json(response)
    }

    fn archive_data_sets(
        &self,
        codes: &[DataSetCode],
        remove_from_store: bool,
        options: &BTreeMap<String, String>,
    ) -> Result<(), DropstoreError> {
        let url = self.url("data-sets/archive");
        let body = ArchiveRequest {
            codes,
            remove_from_store,
            options,
        };
        let response = self.send_with_retries(|| self.client.post(&url).json(&body))?;
        Self::expect_success(response).map(|_| ())
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
