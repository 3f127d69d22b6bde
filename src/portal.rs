use crate::params::{FieldSpec, ParameterSet, FIELDS, PASSWORD};
use crate::provisioning::{CaptivePortal, ProvisionError};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::form::Form;
use rocket::http::{Header, Status};
use rocket::response::content::RawHtml;
use rocket::response::Redirect;
use rocket::serde::{json::Json, Serialize};
use rocket::{get, post, routes, Build, FromForm, Rocket, Shutdown, State};
use std::net::IpAddr;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Form posted by the operator. Field names are the parameter keys.
#[derive(FromForm)]
struct ParameterForm {
    session: String,
    broker_host: String,
    broker_port: String,
    client_id: String,
    username: String,
    password: String,
    topic_temperature: String,
    topic_humidity: String,
}

impl ParameterForm {
    fn pairs(&self) -> [(&str, &str); 7] {
        [
            ("broker_host", self.broker_host.as_str()),
            ("broker_port", self.broker_port.as_str()),
            ("client_id", self.client_id.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("topic_temperature", self.topic_temperature.as_str()),
            ("topic_humidity", self.topic_humidity.as_str()),
        ]
    }
}

/// Status response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct PortalStatus {
    ap_name: String,
    session: String,
    fields: Vec<FieldStatus>,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct FieldStatus {
    #[serde(flatten)]
    spec: FieldSpec,
    value: String,
}

/// Everything the routes need for one portal run.
pub struct PortalState {
    ap_name: String,
    session: Uuid,
    current: ParameterSet,
    submissions: mpsc::Sender<ParameterSet>,
}

impl PortalState {
    pub fn new(
        ap_name: impl Into<String>,
        current: ParameterSet,
        submissions: mpsc::Sender<ParameterSet>,
    ) -> Self {
        Self {
            ap_name: ap_name.into(),
            session: Uuid::new_v4(),
            current,
            submissions,
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }
}

/// Captive portals must never be answered from a cache.
pub struct NoCache;

#[rocket::async_trait]
impl Fairing for NoCache {
    fn info(&self) -> Info {
        Info {
            name: "No-Cache",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(Header::new(
            "Cache-Control",
            "no-cache, no-store, must-revalidate",
        ));
        res.set_header(Header::new("Pragma", "no-cache"));
        res.set_header(Header::new("Expires", "-1"));
    }
}

/// Parameter form, pre-filled with the current values
#[get("/")]
fn index(state: &State<PortalState>) -> RawHtml<String> {
    RawHtml(render_form(state, &state.current.pairs(), None))
}

/// Accept a submitted form
#[post("/save", data = "<form>")]
fn save(form: Form<ParameterForm>, state: &State<PortalState>) -> (Status, RawHtml<String>) {
    if form.session != state.session.to_string() {
        warn!("Rejected form from a stale portal session.");
        return (
            Status::Conflict,
            RawHtml(render_page(
                &state.ap_name,
                "<p>This form has expired. <a href=\"/\">Reload</a> and try again.</p>",
            )),
        );
    }

    let candidate = match ParameterSet::from_pairs(form.pairs()) {
        Ok(candidate) => candidate,
        Err(e) => {
            warn!("Rejected form: {}", e);
            let echo: Vec<(&'static str, String)> = FIELDS
                .iter()
                .zip(form.pairs())
                .map(|(spec, (_, value))| (spec.key, value.to_string()))
                .collect();
            return (
                Status::UnprocessableEntity,
                RawHtml(render_form(state, &echo, Some(&e.to_string()))),
            );
        }
    };

    match state.submissions.try_send(candidate) {
        Ok(()) => {
            info!("Should save config");
            (
                Status::Ok,
                RawHtml(render_page(
                    &state.ap_name,
                    "<p>Saved. The device will now connect with the new settings.</p>",
                )),
            )
        }
        // Only the first accepted submission of a portal run counts.
        Err(TrySendError::Full(_)) => {
            warn!("Rejected form: a submission is already being applied.");
            (
                Status::Conflict,
                RawHtml(render_page(
                    &state.ap_name,
                    "<p>Settings were already submitted and are being applied.</p>",
                )),
            )
        }
        Err(TrySendError::Closed(_)) => (
            Status::ServiceUnavailable,
            RawHtml(render_page(
                &state.ap_name,
                "<p>The configuration window has closed.</p>",
            )),
        ),
    }
}

/// Portal status for diagnostics
#[get("/status")]
fn status(state: &State<PortalState>) -> Json<PortalStatus> {
    let fields = FIELDS
        .iter()
        .map(|spec| FieldStatus {
            spec: *spec,
            value: if spec.key == PASSWORD {
                String::new()
            } else {
                state.current.get(spec.key).unwrap_or_default()
            },
        })
        .collect();

    Json(PortalStatus {
        ap_name: state.ap_name.clone(),
        session: state.session.to_string(),
        fields,
    })
}

/// Connectivity checks of phones and laptops land here.
#[get("/<_..>", rank = 20)]
fn captive() -> Redirect {
    Redirect::to("/")
}

/// Mounts the portal routes and state on the given Rocket instance.
pub fn mount(rocket: Rocket<Build>, state: PortalState) -> Rocket<Build> {
    rocket
        .manage(state)
        .mount("/", routes![index, save, status, captive])
        .attach(NoCache)
}

fn render_form(
    state: &PortalState,
    values: &[(&'static str, String)],
    error: Option<&str>,
) -> String {
    let mut body = String::new();
    if let Some(error) = error {
        body.push_str(&format!("<p class=\"error\">{}</p>\n", escape(error)));
    }
    body.push_str("<form method=\"post\" action=\"/save\">\n");
    body.push_str(&format!(
        "<input type=\"hidden\" name=\"session\" value=\"{}\">\n",
        state.session
    ));
    for spec in FIELDS.iter() {
        let value = values
            .iter()
            .find(|(key, _)| *key == spec.key)
            .map(|(_, value)| value.as_str())
            .unwrap_or(spec.default);
        let kind = if spec.key == PASSWORD { "password" } else { "text" };
        body.push_str(&format!(
            "<label for=\"{key}\">{label}</label>\n<input id=\"{key}\" name=\"{key}\" type=\"{kind}\" maxlength=\"{max}\" value=\"{value}\">\n",
            key = spec.key,
            label = escape(spec.label),
            kind = kind,
            max = spec.max_len,
            value = escape(value),
        ));
    }
    body.push_str("<button type=\"submit\">Save</button>\n</form>");
    render_page(&state.ap_name, &body)
}

fn render_page(ap_name: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><meta name=\"viewport\" content=\"width=device-width\"><title>{title}</title></head>\n<body><h1>{title}</h1>\n{body}\n</body></html>\n",
        title = escape(ap_name),
        body = body
    )
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Rocket server serving the portal while the provisioning flow collects.
pub struct RocketPortal {
    address: IpAddr,
    port: u16,
    running: Option<(Shutdown, JoinHandle<()>)>,
}

impl RocketPortal {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            running: None,
        }
    }
}

impl CaptivePortal for RocketPortal {
    async fn open(
        &mut self,
        ap_name: &str,
        current: &ParameterSet,
    ) -> Result<mpsc::Receiver<ParameterSet>, ProvisionError> {
        self.close().await;

        let (tx, rx) = mpsc::channel(1);
        let figment = rocket::Config::figment()
            .merge(("address", self.address.to_string()))
            .merge(("port", self.port))
            .merge(("log_level", "critical"))
            .merge(("shutdown.ctrlc", false));

        let rocket = mount(rocket::custom(figment), PortalState::new(ap_name, current.clone(), tx))
            .ignite()
            .await
            .map_err(|e| ProvisionError::Portal(e.to_string()))?;

        let shutdown = rocket.shutdown();
        let handle = tokio::spawn(async move {
            if let Err(e) = rocket.launch().await {
                error!("Configuration portal stopped: {}", e);
            }
        });
        info!("Configuration portal listening on {}:{}.", self.address, self.port);
        self.running = Some((shutdown, handle));
        Ok(rx)
    }

    async fn close(&mut self) {
        if let Some((shutdown, handle)) = self.running.take() {
            shutdown.notify();
            if let Err(e) = handle.await {
                error!("Configuration portal task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocket::http::ContentType;
    use rocket::local::asynchronous::Client;

    fn form_body(session: &str, port: &str, host: &str) -> String {
        format!(
            "session={}&broker_host={}&broker_port={}&client_id=Porch&username=u&password=p&topic_temperature=porch%2Ftemp&topic_humidity=porch%2Fhum",
            session, host, port
        )
    }

    async fn client() -> (Client, Uuid, mpsc::Receiver<ParameterSet>) {
        let (tx, rx) = mpsc::channel(1);
        let state = PortalState::new("ESP32_DHT", ParameterSet::default(), tx);
        let session = state.session();
        let client = Client::tracked(mount(rocket::build(), state)).await.unwrap();
        (client, session, rx)
    }

    #[rocket::async_test]
    async fn form_is_prefilled_with_current_values() {
        let (client, session, _rx) = client().await;

        let response = client.get("/").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(
            response.headers().get_one("Cache-Control"),
            Some("no-cache, no-store, must-revalidate")
        );
        let html = response.into_string().await.unwrap();

        assert!(html.contains("<title>ESP32_DHT</title>"));
        assert!(html.contains(&session.to_string()));
        assert!(html.contains(
            "name=\"broker_host\" type=\"text\" maxlength=\"40\" value=\"iotgw.local\""
        ));
        assert!(html.contains("name=\"broker_port\" type=\"text\" maxlength=\"6\" value=\"1883\""));
        assert!(html.contains("name=\"password\" type=\"password\""));
    }

    #[rocket::async_test]
    async fn valid_submission_is_delivered() {
        let (client, session, mut rx) = client().await;

        let response = client
            .post("/save")
            .header(ContentType::Form)
            .body(form_body(&session.to_string(), "8883", "broker.lan"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let candidate = rx.try_recv().unwrap();
        assert_eq!(candidate.broker_host, "broker.lan");
        assert_eq!(candidate.broker_port, 8883);
        assert_eq!(candidate.client_id, "Porch");
        assert_eq!(candidate.topic_temperature, "porch/temp");
    }

    #[rocket::async_test]
    async fn second_submission_is_refused_while_the_first_is_pending() {
        let (client, session, mut rx) = client().await;

        let first = client
            .post("/save")
            .header(ContentType::Form)
            .body(form_body(&session.to_string(), "1883", "first.lan"))
            .dispatch()
            .await;
        assert_eq!(first.status(), Status::Ok);

        let second = client
            .post("/save")
            .header(ContentType::Form)
            .body(form_body(&session.to_string(), "1883", "second.lan"))
            .dispatch()
            .await;
        assert_eq!(second.status(), Status::Conflict);

        assert_eq!(rx.try_recv().unwrap().broker_host, "first.lan");
        assert!(rx.try_recv().is_err());
    }

    #[rocket::async_test]
    async fn stale_session_is_rejected() {
        let (client, _session, mut rx) = client().await;

        let response = client
            .post("/save")
            .header(ContentType::Form)
            .body(form_body(&Uuid::new_v4().to_string(), "1883", "broker.lan"))
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::Conflict);
        assert!(rx.try_recv().is_err());
    }

    #[rocket::async_test]
    async fn empty_field_re_renders_the_form() {
        let (client, session, mut rx) = client().await;

        let response = client
            .post("/save")
            .header(ContentType::Form)
            .body(form_body(&session.to_string(), "1883", ""))
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::UnprocessableEntity);
        let html = response.into_string().await.unwrap();
        assert!(html.contains("must not be empty"));
        assert!(html.contains("value=\"Porch\""));
        assert!(rx.try_recv().is_err());
    }

    #[rocket::async_test]
    async fn status_hides_the_password() {
        let (client, session, _rx) = client().await;

        let response = client.get("/status").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_string().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(json["ap_name"], "ESP32_DHT");
        assert_eq!(json["session"], session.to_string());
        assert_eq!(json["fields"].as_array().unwrap().len(), 7);
        assert_eq!(json["fields"][1]["key"], "broker_port");
        assert_eq!(json["fields"][1]["label"], "MQTT Port");
        assert_eq!(json["fields"][1]["max_len"], 6);
        assert_eq!(json["fields"][1]["value"], "1883");
        assert!(json["fields"][1].get("default").is_none());
        assert!(!body.contains("test_password"));
    }

    #[rocket::async_test]
    async fn detection_probes_are_redirected() {
        let (client, _session, _rx) = client().await;

        let response = client.get("/generate_204").dispatch().await;
        assert_eq!(response.status(), Status::SeeOther);
        assert_eq!(response.headers().get_one("Location"), Some("/"));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }
}
