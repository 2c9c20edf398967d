/// Drive client module.
///
/// Everything the server knows about the remote drive goes through the
/// `DriveService` trait: list files matching a query, fetch one file's
/// metadata, download its content. `DriveRemote` talks to the Google Drive
/// v3 REST API; tests swap in an in-memory drive.
use crate::auth::Credentials;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

pub const DRIVE_API_ROOT: &str = "https://www.googleapis.com/drive/v3";

const FILE_FIELDS: &str = "id, name, parents, modifiedTime, size, owners";

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    #[serde(default)]
    pub display_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    pub modified_time: Option<DateTime<Utc>>,
    /// The API sends sizes as strings.
    #[serde(default, deserialize_with = "de_size")]
    pub size: Option<u64>,
    #[serde(default)]
    pub owners: Vec<Owner>,
}

fn de_size<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => s.parse::<u64>().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[rocket::async_trait]
pub trait DriveService: Send + Sync {
    /// All files matching a Drive query string.
    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>>;

    /// Metadata of a single file.
    async fn get_file(&self, file_id: &str) -> Result<DriveFile>;

    /// Content of a single file, byte for byte.
    async fn download(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// Builds a `DriveService` for a set of credentials. Managed by Rocket so
/// tests can hand out a fake drive.
pub trait DriveConnector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> Box<dyn DriveService>;
}

pub struct DriveRemote {
    api_root: String,
    token: String,
    client: Client,
}

impl DriveRemote {
    pub fn new(api_root: String, token: String, client: Client) -> DriveRemote {
        DriveRemote {
            api_root,
            token,
            client,
        }
    }

    fn build_url(&self, suffix: &str) -> String {
        format!("{}/{}", self.api_root, suffix)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::Drive {
            status: status.as_u16(),
            message,
        })
    }
}

#[rocket::async_trait]
impl DriveService for DriveRemote {
    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>> {
        let fields = format!("nextPageToken, files({})", FILE_FIELDS);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(&self.build_url("files"))
                .bearer_auth(&self.token)
                .query(&[("q", query), ("fields", fields.as_str()), ("pageSize", "1000")]);
            if let Some(token) = page_token.as_ref() {
                request = request.query(&[("pageToken", token)]);
            }
            let page: FileList = DriveRemote::check(request.send().await?)
                .await?
                .json()
                .await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    async fn get_file(&self, file_id: &str) -> Result<DriveFile> {
        let response = self
            .client
            .get(&self.build_url(&format!("files/{}", file_id)))
            .bearer_auth(&self.token)
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await?;
        Ok(DriveRemote::check(response).await?.json().await?)
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&self.build_url(&format!("files/{}", file_id)))
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .await?;
        let bytes = DriveRemote::check(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// Connects to the real Google Drive, sharing one HTTP client.
pub struct RemoteConnector {
    pub api_root: String,
    pub client: Client,
}

impl RemoteConnector {
    pub fn new() -> RemoteConnector {
        RemoteConnector {
            api_root: DRIVE_API_ROOT.to_string(),
            client: Client::new(),
        }
    }
}

impl DriveConnector for RemoteConnector {
    fn connect(&self, credentials: &Credentials) -> Box<dyn DriveService> {
        Box::new(DriveRemote::new(
            self.api_root.clone(),
            credentials.token.clone(),
            self.client.clone(),
        ))
    }
}

/// Quote a value for use inside a Drive query string literal.
pub fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{}'", escaped)
}

/// Query for a file called `name` directly inside `folder_id`.
pub fn child_query(folder_id: &str, name: &str) -> String {
    format!(
        "{} in parents and name={} and trashed=false",
        quote(folder_id),
        quote(name)
    )
}

/// Query for every file called `name`, wherever it lives.
pub fn name_query(name: &str) -> String {
    format!("name = {} and trashed=false", quote(name))
}

/// Find a file by parent folder and name. First match wins; Drive allows
/// duplicate names, we don't care which one we get.
pub async fn find_file(
    drive: &dyn DriveService,
    folder_id: &str,
    name: &str,
) -> Result<Option<DriveFile>> {
    let mut files = drive.list_files(&child_query(folder_id, name)).await?;
    if files.is_empty() {
        return Ok(None);
    }
    Ok(Some(files.remove(0)))
}

/// Like `find_file`, but a missing file is an error.
pub async fn require_file(
    drive: &dyn DriveService,
    folder_id: &str,
    name: &str,
) -> Result<DriveFile> {
    find_file(drive, folder_id, name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("{} in {}", name, folder_id)))
}

/// Remote modification time of a file.
pub async fn modified_time(drive: &dyn DriveService, file: &DriveFile) -> Result<DateTime<Utc>> {
    if let Some(t) = file.modified_time {
        return Ok(t);
    }
    drive
        .get_file(&file.id)
        .await?
        .modified_time
        .ok_or_else(|| Error::NotFound(format!("modified time of {}", file.id)))
}

/// Names of the folders from `top` (exclusive) down to `bottom`, as
/// `["Data", ..., name of bottom]`.
///
/// Returns an empty list when `bottom` isn't below `top`.
pub async fn folder_path(drive: &dyn DriveService, top: &str, bottom: &str) -> Result<Vec<String>> {
    let mut path = Vec::new();
    let mut current = bottom.to_string();
    while current != top {
        let folder = drive.get_file(&current).await?;
        let parent = match folder.parents.first() {
            Some(p) => p.clone(),
            None => return Ok(vec![]),
        };
        path.push(folder.name);
        current = parent;
    }
    path.push("Data".to_string());
    path.reverse();
    Ok(path)
}
