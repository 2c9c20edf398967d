/// Server module.
///
/// Routes, catchers and the fairings that install configuration. `main`
/// only launches what `rocket()` builds, so tests can swap the drive.
use crate::artifacts::{ImageFormat, Pipeline};
use crate::auth::{self, ClientSecrets, NEXT_URL_COOKIE, STATE_COOKIE};
use crate::cache::DiskCache;
use crate::config::{self, ConversionSettings, DriveSettings, StaticRoot};
use crate::datasets;
use crate::drive::{DriveConnector, RemoteConnector};
use crate::error::{Error, Result};
use crate::usage_tracker;
use rocket::fairing::AdHoc;
use rocket::figment::Figment;
use rocket::fs::NamedFile;
use rocket::http::{ContentType, Cookie, CookieJar};
use rocket::request::{FromParam, Request};
use rocket::response::content::{RawHtml, RawJson};
use rocket::response::Redirect;
use rocket::{catch, catchers, get, routes, Build, Rocket, State};

/// Everything the browser can ask for inside an experiment folder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Artifact {
    MassOverTimePb,
    MassOverTimeCsv,
    ImageMetadata,
    ImageBundle {
        location: u32,
        bundle: u32,
        format: ImageFormat,
    },
    LabelBundle {
        location: u32,
        bundle: u32,
    },
}

/// `<loc>_<bundle>` as two numbers.
fn location_and_bundle(value: &str) -> Option<(u32, u32)> {
    let (location, bundle) = value.split_once('_')?;
    Some((location.parse().ok()?, bundle.parse().ok()?))
}

impl Artifact {
    pub fn parse(name: &str) -> Option<Artifact> {
        match name {
            "massOverTime.pb" => return Some(Artifact::MassOverTimePb),
            "massOverTime.csv" => return Some(Artifact::MassOverTimeCsv),
            "imageMetaData.json" => return Some(Artifact::ImageMetadata),
            _ => {}
        }
        if let Some(rest) = name.strip_prefix("img_") {
            let (stem, format) = if let Some(stem) = rest.strip_suffix(".jpg") {
                (stem, ImageFormat::Jpeg)
            } else {
                (rest.strip_suffix(".png")?, ImageFormat::Png)
            };
            let (location, bundle) = location_and_bundle(stem)?;
            return Some(Artifact::ImageBundle {
                location,
                bundle,
                format,
            });
        }
        let stem = name.strip_prefix("label_")?.strip_suffix(".pb")?;
        let (location, bundle) = location_and_bundle(stem)?;
        Some(Artifact::LabelBundle { location, bundle })
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Artifact::MassOverTimePb | Artifact::LabelBundle { .. } => ContentType::Binary,
            Artifact::MassOverTimeCsv => ContentType::CSV,
            Artifact::ImageMetadata => ContentType::JSON,
            Artifact::ImageBundle {
                format: ImageFormat::Jpeg,
                ..
            } => ContentType::JPEG,
            Artifact::ImageBundle {
                format: ImageFormat::Png,
                ..
            } => ContentType::PNG,
        }
    }
}

impl<'a> FromParam<'a> for Artifact {
    type Error = &'a str;

    fn from_param(param: &'a str) -> std::result::Result<Self, Self::Error> {
        Artifact::parse(param).ok_or(param)
    }
}

/// `<datasetId>.json`
pub struct DatasetFile(pub String);

impl<'a> FromParam<'a> for DatasetFile {
    type Error = &'a str;

    fn from_param(param: &'a str) -> std::result::Result<Self, Self::Error> {
        match param.strip_suffix(".json") {
            Some(id) if !id.is_empty() => Ok(DatasetFile(id.to_string())),
            _ => Err(param),
        }
    }
}

async fn page(statics: &StaticRoot, name: &str) -> Result<NamedFile> {
    NamedFile::open(statics.0.join(name))
        .await
        .map_err(|e| Error::NotFound(format!("{}: {}", name, e)))
}

#[get("/")]
async fn index(statics: &State<StaticRoot>) -> Result<NamedFile> {
    page(statics, "index.html").await
}

#[get("/overview")]
async fn overview(
    jar: &CookieJar<'_>,
    settings: &State<DriveSettings>,
    statics: &State<StaticRoot>,
) -> Result<NamedFile> {
    auth::require_session(jar, settings, "")?;
    page(statics, "overview.html").await
}

#[get("/detailedView/<dataset_id>")]
async fn detailed_view(
    dataset_id: &str,
    jar: &CookieJar<'_>,
    settings: &State<DriveSettings>,
    statics: &State<StaticRoot>,
) -> Result<NamedFile> {
    auth::require_session(jar, settings, dataset_id)?;
    page(statics, "detailedView.html").await
}

/// Start the OAuth flow.
#[get("/auth")]
fn authorize(jar: &CookieJar<'_>, settings: &State<DriveSettings>) -> Result<Redirect> {
    let secrets = ClientSecrets::load(&settings.client_secrets_filename)?;
    let state = auth::new_state();
    let url = auth::authorization_url(&secrets, &auth::redirect_uri(settings), &state)?;
    jar.add_private(Cookie::new(STATE_COOKIE, state));
    Ok(Redirect::to(url.to_string()))
}

#[get("/authCallback?<state>&<code>&<error>")]
async fn auth_callback(
    state: Option<String>,
    code: Option<String>,
    error: Option<String>,
    jar: &CookieJar<'_>,
    settings: &State<DriveSettings>,
    client: &State<reqwest::Client>,
) -> Result<Redirect> {
    let expected = jar.get_private(STATE_COOKIE).map(|c| c.value().to_string());
    if expected.is_none() || expected != state {
        return Err(Error::BadRequest("oauth state mismatch".to_string()));
    }
    jar.remove_private(STATE_COOKIE);
    if let Some(error) = error {
        return Err(Error::BadRequest(format!("authorization refused: {}", error)));
    }
    let code = code.ok_or_else(|| Error::BadRequest("no authorization code".to_string()))?;

    let secrets = ClientSecrets::load(&settings.client_secrets_filename)?;
    let credentials =
        auth::exchange_code(client, &secrets, &auth::redirect_uri(settings), &code).await?;
    auth::store_credentials(jar, &credentials)?;

    let next = jar
        .get_private(NEXT_URL_COOKIE)
        .map(|c| c.value().to_string())
        .unwrap_or_else(|| "/".to_string());
    jar.remove_private(NEXT_URL_COOKIE);
    info!("Logged in, continuing to {}", next);
    Ok(Redirect::to(next))
}

#[get("/data/datasetList.json")]
fn dataset_list(
    jar: &CookieJar<'_>,
    settings: &State<DriveSettings>,
    cache: &State<DiskCache>,
) -> Result<RawJson<Vec<u8>>> {
    auth::require_session(jar, settings, "")?;
    let data = datasets::dataset_list(cache)?;
    Ok(RawJson(data.unwrap_or_else(|| b"{}".to_vec())))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Rebuild the dataset list and report what happened to every folder.
#[get("/data/update_dataset_list")]
async fn update_dataset_list(
    jar: &CookieJar<'_>,
    settings: &State<DriveSettings>,
    connector: &State<Box<dyn DriveConnector>>,
    cache: &State<DiskCache>,
) -> Result<RawHtml<String>> {
    let credentials = auth::drive_credentials(jar, settings, "")?;
    let drive = connector.connect(&credentials);
    let report =
        datasets::update_dataset_list(drive.as_ref(), &settings.top_folder_id, cache).await?;
    info!("{}", report.summary());

    let mut html = String::from("<html><body><ul>\n");
    for line in &report.lines {
        html.push_str(&format!("<li>{}</li>\n", escape_html(line)));
    }
    html.push_str(&format!(
        "</ul>\n<p>{}</p></body></html>\n",
        escape_html(&report.summary())
    ));
    Ok(RawHtml(html))
}

#[get("/data/<dataset>")]
fn dataset_spec(
    dataset: DatasetFile,
    jar: &CookieJar<'_>,
    settings: &State<DriveSettings>,
    cache: &State<DiskCache>,
) -> Result<RawJson<Vec<u8>>> {
    auth::require_session(jar, settings, &dataset.0)?;
    let data = datasets::dataset_spec(cache, &dataset.0)?;
    Ok(RawJson(data.unwrap_or_else(|| b"{}".to_vec())))
}

#[get("/data/<folder_id>/<artifact>")]
async fn artifact(
    folder_id: &str,
    artifact: Artifact,
    jar: &CookieJar<'_>,
    settings: &State<DriveSettings>,
    conversion: &State<ConversionSettings>,
    connector: &State<Box<dyn DriveConnector>>,
    cache: &State<DiskCache>,
) -> Result<(ContentType, Vec<u8>)> {
    let credentials = auth::drive_credentials(jar, settings, folder_id)?;
    let drive = connector.connect(&credentials);
    let pipeline = Pipeline::new(drive.as_ref(), cache, conversion);
    let data = match artifact {
        Artifact::MassOverTimePb => pipeline.mass_over_time_pb(folder_id).await?,
        Artifact::MassOverTimeCsv => pipeline.mass_over_time_csv(folder_id).await?,
        Artifact::ImageMetadata => pipeline.image_metadata(folder_id).await?,
        Artifact::ImageBundle {
            location,
            bundle,
            format,
        } => {
            pipeline
                .image_bundle(folder_id, location, bundle, format)
                .await?
        }
        Artifact::LabelBundle { location, bundle } => {
            pipeline.label_bundle(folder_id, location, bundle).await?
        }
    };
    Ok((artifact.content_type(), data))
}

#[get("/spinner.gif")]
fn spinner() -> Redirect {
    Redirect::to("/static/assets/spinner.gif")
}

/// Remember where the user was going, then log in.
#[catch(401)]
fn unauthorized(req: &Request) -> Redirect {
    req.cookies()
        .add_private(Cookie::new(NEXT_URL_COOKIE, req.uri().to_string()));
    Redirect::to("/auth")
}

const NOT_FOUND_IMAGE: &str = "/static/404.jpg";

/// Missing pages show the 404 image; a missing image falls back to
/// Rocket's default page.
fn show_not_found(req: &Request) -> Option<Redirect> {
    info!("Not found: {}", req.uri());
    if req.uri().path().raw().as_str() == NOT_FOUND_IMAGE {
        return None;
    }
    Some(Redirect::to(NOT_FOUND_IMAGE))
}

#[catch(404)]
fn not_found(req: &Request) -> Option<Redirect> {
    show_not_found(req)
}

/// A path segment that isn't an artifact or dataset name is forwarded with
/// 422; to the browser it is just a missing file.
#[catch(422)]
fn unknown_name(req: &Request) -> Option<Redirect> {
    show_not_found(req)
}

/// The server over any drive, configured from `figment`.
pub fn build(figment: Figment, connector: Box<dyn DriveConnector>) -> Rocket<Build> {
    rocket::custom(figment)
        .attach(AdHoc::try_on_ignite("Cache Root", |rocket| async {
            config::get_cache_root(rocket)
        }))
        .attach(AdHoc::try_on_ignite("Static Root", |rocket| async {
            config::get_static_root(rocket)
        }))
        .attach(AdHoc::try_on_ignite("Drive Settings", |rocket| async {
            config::get_drive_settings(rocket)
        }))
        .attach(AdHoc::try_on_ignite("Conversion Settings", |rocket| async {
            config::get_conversion_settings(rocket)
        }))
        .attach(AdHoc::try_on_ignite("Usage Tracker Config", |rocket| async {
            config::get_usage_tracker(rocket)
        }))
        .attach(AdHoc::try_on_ignite("Disk Cache", |rocket| async {
            usage_tracker::start_disk_cache(rocket)
        }))
        .manage(connector)
        .manage(reqwest::Client::new())
        .mount(
            "/",
            routes![
                index,
                overview,
                detailed_view,
                authorize,
                auth_callback,
                dataset_list,
                update_dataset_list,
                dataset_spec,
                artifact,
                spinner
            ],
        )
        .register("/", catchers![unauthorized, not_found, unknown_name])
}

/// The server against Google Drive, configured from Rocket.toml and the
/// environment.
pub fn rocket() -> Rocket<Build> {
    build(rocket::Config::figment(), Box::new(RemoteConnector::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::drive::mock::MockDrive;
    use crate::matrix::testing::mat_v5;
    use rocket::http::{Header, Status};
    use rocket::local::blocking::Client;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        client: Client,
        dir: TempDir,
        drive: MockDrive,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let statics = dir.path().join("static");
        fs::create_dir_all(&statics).unwrap();
        fs::write(statics.join("index.html"), "<html>cellviz</html>").unwrap();
        fs::write(statics.join("overview.html"), "<html>overview</html>").unwrap();

        let credentials = Credentials {
            token: "demo-token".to_string(),
            refresh_token: None,
            token_uri: "https://oauth2.example.com/token".to_string(),
            client_id: "abc".to_string(),
            client_secret: "s3cret".to_string(),
            scopes: vec![auth::DRIVE_READONLY_SCOPE.to_string()],
            expiry: None,
        };
        let demo_credentials = dir.path().join("demo.json");
        fs::write(&demo_credentials, serde_json::to_vec(&credentials).unwrap()).unwrap();
        let secrets = dir.path().join("secrets.json");
        fs::write(
            &secrets,
            br#"{"web": {"client_id": "abc", "client_secret": "s3cret",
                 "auth_uri": "https://accounts.example.com/o/oauth2/auth"}}"#,
        )
        .unwrap();

        let drive = MockDrive::default();
        let track = mat_v5(&[(
            "data_allframes",
            &[2, 7],
            &[1.0, 2.0, 0.0, 1.0, 3.0, 4.0, 10.0, 20.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0],
        )]);
        drive.add("demo", "Demo Experiment", "", b"");
        drive.add("track", "data_allframes.mat", "demo", &track);

        let figment = rocket::Config::figment()
            .merge(("cache_root", dir.path().join("cache")))
            .merge(("static_root", statics))
            .merge(("demo_id", "demo"))
            .merge(("demo_credentials_filename", demo_credentials))
            .merge(("client_secrets_filename", secrets))
            .merge(("public_url", "http://viz.example.com"))
            .merge(("usage_tracker", "none"));
        let client = Client::tracked(build(figment, Box::new(drive.clone()))).unwrap();
        Fixture { client, dir, drive }
    }

    fn location(response: &rocket::local::blocking::LocalResponse) -> String {
        response.headers().get_one("Location").unwrap_or("").to_string()
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(
            Some(Artifact::ImageBundle {
                location: 2,
                bundle: 0,
                format: ImageFormat::Png
            }),
            Artifact::parse("img_2_0.png")
        );
        assert_eq!(
            Some(Artifact::LabelBundle {
                location: 1,
                bundle: 3
            }),
            Artifact::parse("label_1_3.pb")
        );
        assert_eq!(Some(Artifact::MassOverTimeCsv), Artifact::parse("massOverTime.csv"));
        assert_eq!(None, Artifact::parse("img_1.jpg"));
        assert_eq!(None, Artifact::parse("img_a_1.jpg"));
        assert_eq!(None, Artifact::parse("label_1_1.json"));
        assert_eq!(None, Artifact::parse("notes.txt"));
    }

    #[test]
    fn test_index_is_public() {
        let f = fixture();
        let response = f.client.get("/").dispatch();
        assert_eq!(Status::Ok, response.status());
        assert_eq!("<html>cellviz</html>", response.into_string().unwrap());
    }

    #[test]
    fn test_demo_folder_serves_csv_without_login() {
        let f = fixture();
        let response = f.client.get("/data/demo/massOverTime.csv").dispatch();
        assert_eq!(Status::Ok, response.status());
        assert_eq!(Some(ContentType::CSV), response.content_type());
        let csv = response.into_string().unwrap();
        assert!(csv.starts_with("id,time,x,y,Mass (pg),Location ID,Frame ID\n"));
        assert!(csv.contains("1,0,3,10,1,1,1\n"));
        assert_eq!(vec!["track".to_string()], *f.drive.downloads.lock().unwrap());
    }

    #[test]
    fn test_private_folder_sends_user_to_login() {
        let f = fixture();
        let response = f.client.get("/data/private/massOverTime.pb").dispatch();
        assert_eq!(Status::SeeOther, response.status());
        assert_eq!("/auth", location(&response));
        let next = f.client.cookies().get_private(NEXT_URL_COOKIE).unwrap();
        assert_eq!("/data/private/massOverTime.pb", next.value());
        assert!(f.drive.downloads.lock().unwrap().is_empty());
    }

    #[test]
    fn test_auth_redirects_to_google_with_state() {
        let f = fixture();
        let response = f.client.get("/auth").dispatch();
        assert_eq!(Status::SeeOther, response.status());
        let target = location(&response);
        assert!(target.starts_with("https://accounts.example.com/o/oauth2/auth?"));
        let state = f.client.cookies().get_private(STATE_COOKIE).unwrap();
        assert!(target.contains(&format!("state={}", state.value())));
        assert!(target.contains("authCallback"));
    }

    #[test]
    fn test_callback_rejects_unknown_state() {
        let f = fixture();
        f.client.get("/auth").dispatch();
        let response = f
            .client
            .get("/authCallback?state=forged&code=abc")
            .dispatch();
        assert_eq!(Status::BadRequest, response.status());
        assert!(f
            .client
            .cookies()
            .get_private(auth::CREDENTIALS_COOKIE)
            .is_none());
    }

    #[test]
    fn test_unknown_routes_show_the_404_image() {
        let f = fixture();
        let response = f.client.get("/data/demo/notes.txt").dispatch();
        assert_eq!(Status::SeeOther, response.status());
        assert_eq!("/static/404.jpg", location(&response));

        for path in &["/data/demo/img_1.jpg", "/data/notes", "/data/.json"] {
            let response = f.client.get(*path).dispatch();
            assert_eq!(Status::SeeOther, response.status(), "{}", path);
            assert_eq!("/static/404.jpg", location(&response), "{}", path);
        }

        let response = f.client.get("/static/404.jpg").dispatch();
        assert_eq!(Status::NotFound, response.status());
    }

    #[test]
    fn test_dataset_spec_defaults_to_empty_object() {
        let f = fixture();
        let response = f.client.get("/data/demo.json").dispatch();
        assert_eq!(Status::Ok, response.status());
        assert_eq!("{}", response.into_string().unwrap());

        let list = f.dir.path().join("cache").join(config::DATASET_LIST_FOLDER);
        fs::create_dir_all(&list).unwrap();
        fs::write(list.join("demo.json"), br#"{"uniqueId": "demo"}"#).unwrap();
        let response = f
            .client
            .get("/data/demo.json")
            .header(Header::new("Accept", "application/json"))
            .dispatch();
        assert_eq!(Some(ContentType::JSON), response.content_type());
        assert_eq!(r#"{"uniqueId": "demo"}"#, response.into_string().unwrap());
    }

    #[test]
    fn test_spinner_moved_under_static() {
        let f = fixture();
        let response = f.client.get("/spinner.gif").dispatch();
        assert_eq!("/static/assets/spinner.gif", location(&response));
    }
}
