/// Auth module.
///
/// OAuth2 authorization-code flow against Google, with the resulting
/// credentials kept in an encrypted session cookie. Tokens are not
/// refreshed: once a token expires the user goes through `/auth` again.
use crate::config::{self, DriveSettings};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Client, Url};
use rocket::http::{Cookie, CookieJar};
use serde::{Deserialize, Serialize};

pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";

pub const CREDENTIALS_COOKIE: &str = "credentials";
pub const STATE_COOKIE: &str = "oauth_state";
pub const NEXT_URL_COOKIE: &str = "next_url";

/// The `web` (or `installed`) block of a Google client-secrets file.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    web: Option<ClientSecrets>,
    installed: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn from_json(bytes: &[u8]) -> Result<ClientSecrets> {
        let file: ClientSecretsFile = serde_json::from_slice(bytes)?;
        file.web
            .or(file.installed)
            .ok_or_else(|| Error::Config("client secrets have no `web` section".to_string()))
    }

    pub fn load(path: &str) -> Result<ClientSecrets> {
        ClientSecrets::from_json(&config::read_config_file(path)?)
    }
}

/// What the session remembers about a login.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Usable right now: has a token that hasn't expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.token.is_empty() {
            return false;
        }
        match self.expiry {
            Some(expiry) => expiry > now,
            None => true,
        }
    }

    /// Stored credentials for the public demo dataset.
    pub fn load(path: &str) -> Result<Credentials> {
        Ok(serde_json::from_slice(&config::read_config_file(path)?)?)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

/// Random value tying the callback to the request that started the flow.
pub fn new_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Where the browser goes to grant drive access.
pub fn authorization_url(secrets: &ClientSecrets, redirect_uri: &str, state: &str) -> Result<Url> {
    Url::parse_with_params(
        &secrets.auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", DRIVE_READONLY_SCOPE),
            ("state", state),
            ("access_type", "offline"),
            ("include_granted_scopes", "true"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| Error::Config(format!("bad auth uri {}: {}", secrets.auth_uri, e)))
}

/// The callback URL registered with Google.
pub fn redirect_uri(settings: &DriveSettings) -> String {
    format!("{}/authCallback", settings.public_url.trim_end_matches('/'))
}

/// Trade an authorization code for credentials.
pub async fn exchange_code(
    client: &Client,
    secrets: &ClientSecrets,
    redirect_uri: &str,
    code: &str,
) -> Result<Credentials> {
    let response = client
        .post(&secrets.token_uri)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", secrets.client_id.as_str()),
            ("client_secret", secrets.client_secret.as_str()),
        ])
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Drive {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    let token: TokenResponse = response.json().await?;
    Ok(credentials_from_token(secrets, token, Utc::now()))
}

fn credentials_from_token(
    secrets: &ClientSecrets,
    token: TokenResponse,
    now: DateTime<Utc>,
) -> Credentials {
    Credentials {
        token: token.access_token,
        refresh_token: token.refresh_token,
        token_uri: secrets.token_uri.clone(),
        client_id: secrets.client_id.clone(),
        client_secret: secrets.client_secret.clone(),
        scopes: token
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| vec![DRIVE_READONLY_SCOPE.to_string()]),
        expiry: token.expires_in.map(|secs| now + Duration::seconds(secs)),
    }
}

/// Session cookie helpers.
pub fn store_credentials(jar: &CookieJar<'_>, credentials: &Credentials) -> Result<()> {
    let value = serde_json::to_string(credentials)?;
    jar.add_private(Cookie::new(CREDENTIALS_COOKIE, value));
    Ok(())
}

pub fn session_credentials(jar: &CookieJar<'_>) -> Option<Credentials> {
    let cookie = jar.get_private(CREDENTIALS_COOKIE)?;
    serde_json::from_str(cookie.value()).ok()
}

/// Credentials to reach the drive for a request about `folder_or_dataset`.
///
/// The demo dataset is open to everyone and uses stored credentials; every
/// other request needs a valid session.
pub fn drive_credentials(
    jar: &CookieJar<'_>,
    settings: &DriveSettings,
    folder_or_dataset: &str,
) -> Result<Credentials> {
    if settings.demo.allows(folder_or_dataset) {
        return Credentials::load(&settings.demo.credentials_filename);
    }
    match session_credentials(jar) {
        Some(credentials) if credentials.is_valid(Utc::now()) => Ok(credentials),
        _ => Err(Error::Unauthorized),
    }
}

/// Same check without needing the credentials, for pages that only serve
/// local files.
pub fn require_session(
    jar: &CookieJar<'_>,
    settings: &DriveSettings,
    folder_or_dataset: &str,
) -> Result<()> {
    if settings.demo.allows(folder_or_dataset) {
        return Ok(());
    }
    drive_credentials(jar, settings, folder_or_dataset).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::testing;
    use chrono::TimeZone;
    use rocket::form::Form;
    use rocket::http::Status;
    use rocket::response::content::RawJson;
    use rocket::{post, routes, FromForm};

    #[derive(FromForm)]
    struct TokenForm<'r> {
        grant_type: &'r str,
        code: &'r str,
        redirect_uri: &'r str,
        client_id: &'r str,
        client_secret: &'r str,
    }

    #[post("/token", data = "<form>")]
    fn token(form: Form<TokenForm<'_>>) -> std::result::Result<RawJson<&'static str>, Status> {
        if form.grant_type != "authorization_code"
            || form.code != "good-code"
            || form.redirect_uri != "http://localhost:8000/authCallback"
            || form.client_id != "abc.apps"
            || form.client_secret != "s3cret"
        {
            return Err(Status::BadRequest);
        }
        Ok(RawJson(
            r#"{"access_token": "tok", "expires_in": 3600, "refresh_token": "ref",
                "scope": "https://www.googleapis.com/auth/drive.readonly",
                "token_type": "Bearer"}"#,
        ))
    }

    fn secrets() -> ClientSecrets {
        ClientSecrets::from_json(
            br#"{"web": {"client_id": "abc.apps", "client_secret": "s3cret",
                 "auth_uri": "https://accounts.example.com/o/oauth2/auth",
                 "token_uri": "https://oauth2.example.com/token",
                 "redirect_uris": ["http://localhost:8000/authCallback"]}}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_client_secrets_accept_installed_section() {
        let installed =
            ClientSecrets::from_json(br#"{"installed": {"client_id": "x", "client_secret": "y"}}"#)
                .unwrap();
        assert_eq!("https://oauth2.googleapis.com/token", installed.token_uri);
        assert!(ClientSecrets::from_json(br#"{"other": {}}"#).is_err());
    }

    #[test]
    fn test_authorization_url_asks_for_offline_readonly_access() {
        let url = authorization_url(&secrets(), "http://localhost:8000/authCallback", "xyz").unwrap();
        let params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(url.as_str().starts_with("https://accounts.example.com/o/oauth2/auth?"));
        assert!(params.contains(&("scope".to_string(), DRIVE_READONLY_SCOPE.to_string())));
        assert!(params.contains(&("access_type".to_string(), "offline".to_string())));
        assert!(params.contains(&("state".to_string(), "xyz".to_string())));
        assert!(params.contains(&(
            "redirect_uri".to_string(),
            "http://localhost:8000/authCallback".to_string()
        )));
    }

    #[test]
    fn test_credentials_expire() {
        let now = Utc.ymd(2020, 4, 19).and_hms(12, 0, 0);
        let token = TokenResponse {
            access_token: "tok".to_string(),
            expires_in: Some(3600),
            refresh_token: Some("ref".to_string()),
            scope: None,
        };
        let credentials = credentials_from_token(&secrets(), token, now);
        assert_eq!("https://oauth2.example.com/token", credentials.token_uri);
        assert_eq!(vec![DRIVE_READONLY_SCOPE.to_string()], credentials.scopes);
        assert!(credentials.is_valid(now));
        assert!(!credentials.is_valid(now + Duration::hours(2)));

        let empty = Credentials {
            token: String::new(),
            ..credentials
        };
        assert!(!empty.is_valid(now));
    }

    #[rocket::async_test]
    async fn test_exchange_code_posts_the_code_form() {
        let base = testing::serve(rocket::build().mount("/", routes![token])).await;
        let mut secrets = secrets();
        secrets.token_uri = format!("{}/token", base);
        let client = Client::new();
        let redirect = "http://localhost:8000/authCallback";

        let before = Utc::now();
        let credentials = exchange_code(&client, &secrets, redirect, "good-code")
            .await
            .unwrap();
        assert_eq!("tok", credentials.token);
        assert_eq!(Some("ref".to_string()), credentials.refresh_token);
        assert_eq!(secrets.token_uri, credentials.token_uri);
        assert_eq!(vec![DRIVE_READONLY_SCOPE.to_string()], credentials.scopes);
        assert!(credentials.expiry.unwrap() >= before + Duration::seconds(3600));
        assert!(credentials.is_valid(Utc::now()));

        match exchange_code(&client, &secrets, redirect, "bad-code").await {
            Err(Error::Drive { status: 400, .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_state_is_random() {
        let a = new_state();
        assert_eq!(32, a.len());
        assert_ne!(a, new_state());
    }
}
