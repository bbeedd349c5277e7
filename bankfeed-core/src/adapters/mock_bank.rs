//! Mock bank data server for testing
//!
//! Serves both provider APIs from one port so the adapters can be exercised
//! end to end without sandbox credentials:
//! - GoCardless: token, institutions, agreements, requisitions, account
//!   details and booked transactions
//! - TrueLayer: token exchange and refresh, providers, /me, accounts, cards
//!   and their transactions

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{Duration, NaiveDate, Utc};
use serde_json::{json, Value as JsonValue};

pub const GC_ACCESS_TOKEN: &str = "gc-access";
pub const TL_ACCESS_TOKEN: &str = "tl-access";
pub const TL_GOOD_CODE: &str = "good-code";

/// Mock bank server for testing
pub struct MockBankServer {
    port: u16,
    running: Arc<AtomicBool>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

/// Scenario switches
#[derive(Debug, Clone)]
pub struct MockBankConfig {
    pub transactions_per_account: usize,
    /// Transaction endpoints answer 429 with `Retry-After: 30`
    pub rate_limit: bool,
    /// Data endpoints answer as if consent was withdrawn
    pub consent_revoked: bool,
    /// TrueLayer refresh grants are rejected
    pub fail_refresh: bool,
    /// GoCardless requisition status code
    pub requisition_status: &'static str,
    /// Unmappable records appended to every transaction list
    pub malformed_transactions: usize,
}

impl Default for MockBankConfig {
    fn default() -> Self {
        Self {
            transactions_per_account: 5,
            rate_limit: false,
            consent_revoked: false,
            fail_refresh: false,
            requisition_status: "LN",
            malformed_transactions: 0,
        }
    }
}

struct Request {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: String,
}

impl Request {
    fn bearer(&self) -> Option<&str> {
        self.headers
            .get("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
    }

    fn form(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .into_owned()
            .collect()
    }
}

struct Response {
    status: u16,
    body: JsonValue,
    headers: Vec<(&'static str, String)>,
}

impl Response {
    fn ok(body: JsonValue) -> Self {
        Self::status(200, body)
    }

    fn status(status: u16, body: JsonValue) -> Self {
        Self {
            status,
            body,
            headers: Vec::new(),
        }
    }

    fn rate_limited() -> Self {
        Self {
            status: 429,
            body: json!({"summary": "Rate limit exceeded", "detail": "Try again later"}),
            headers: vec![("Retry-After", "30".to_string())],
        }
    }
}

impl MockBankServer {
    /// Start on a random free port
    pub fn start(config: MockBankConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        listener.set_nonblocking(true)?;

        let thread_handle = thread::spawn(move || {
            while running_clone.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let cfg = config.clone();
                        thread::spawn(move || handle_connection(stream, port, &cfg));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(std::time::Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            port,
            running,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockBankServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_request(stream: &TcpStream) -> Option<Request> {
    stream.set_nonblocking(false).ok()?;
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).ok()?;

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (
            p.to_string(),
            url::form_urlencoded::parse(q.as_bytes()).into_owned().collect(),
        ),
        None => (target, HashMap::new()),
    };

    Some(Request {
        method,
        path,
        query,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn handle_connection(mut stream: TcpStream, port: u16, config: &MockBankConfig) {
    let response = match read_request(&stream) {
        Some(request) => route(&request, port, config),
        None => Response::status(400, json!({"error": "Invalid request"})),
    };
    send_response(&mut stream, response);
}

fn route(req: &Request, port: u16, config: &MockBankConfig) -> Response {
    let segments: Vec<&str> = req.path.trim_matches('/').split('/').collect();
    match (req.method.as_str(), segments.as_slice()) {
        // GoCardless
        ("POST", ["token", "new"]) => gc_new_token(req),
        ("POST", ["token", "refresh"]) => Response::ok(json!({"access": GC_ACCESS_TOKEN, "access_expires": 86400})),
        (_, [first, ..]) if is_gocardless_resource(first) && req.bearer() != Some(GC_ACCESS_TOKEN) => {
            Response::status(401, json!({"summary": "Invalid token", "status_code": 401}))
        }
        ("GET", ["institutions"]) => gc_institutions(req),
        ("POST", ["agreements", "enduser"]) => Response::status(
            201,
            json!({"id": "agr-1", "access_valid_for_days": 90, "created": Utc::now().to_rfc3339()}),
        ),
        ("GET", ["agreements", "enduser", id]) => Response::ok(json!({
            "id": id,
            "access_valid_for_days": 90,
            "created": (Utc::now() - Duration::hours(1)).to_rfc3339(),
            "accepted": Utc::now().to_rfc3339(),
        })),
        ("POST", ["requisitions"]) => Response::status(
            201,
            json!({
                "id": "req-1",
                "status": "CR",
                "agreement": "agr-1",
                "accounts": [],
                "link": format!("http://127.0.0.1:{}/link/req-1", port),
            }),
        ),
        ("GET", ["requisitions", id]) => {
            let accounts: Vec<&str> = if config.requisition_status == "LN" {
                vec!["acc-1", "acc-2"]
            } else {
                Vec::new()
            };
            Response::ok(json!({
                "id": id,
                "status": config.requisition_status,
                "agreement": "agr-1",
                "accounts": accounts,
            }))
        }
        ("DELETE", ["requisitions", _]) => Response::ok(json!({"summary": "Requisition deleted"})),
        ("GET", ["accounts", id, "details"]) => {
            if config.consent_revoked {
                return gc_access_expired();
            }
            Response::ok(json!({"account": {
                "iban": format!("DE8937040044053201300{}", id.len() % 10),
                "currency": "EUR",
                "name": format!("Girokonto {}", id),
            }}))
        }
        ("GET", ["accounts", id, "transactions"]) => {
            if config.rate_limit {
                return Response::rate_limited();
            }
            if config.consent_revoked {
                return gc_access_expired();
            }
            let (from, to) = window(req, "date_from", "date_to");
            let mut booked: Vec<JsonValue> = (0..config.transactions_per_account)
                .map(|i| {
                    let outgoing = i % 2 == 0;
                    json!({
                        "transactionId": format!("{}-{}", id, i),
                        "bookingDate": spread(from, to, i).to_string(),
                        "transactionAmount": {
                            "amount": if outgoing { format!("-{}.{:02}", 10 + i, i) } else { format!("{}.00", 100 + i) },
                            "currency": "EUR",
                        },
                        "creditorName": if outgoing { Some(format!("Merchant {}", i)) } else { None },
                        "debtorName": if outgoing { None } else { Some("Employer GmbH".to_string()) },
                        "remittanceInformationUnstructured": format!("REF-{}-{}", id, i),
                    })
                })
                .collect();
            // No booking or value date
            booked.extend((0..config.malformed_transactions).map(|i| {
                json!({
                    "transactionId": format!("{}-broken-{}", id, i),
                    "transactionAmount": {"amount": "-1.00", "currency": "EUR"},
                })
            }));
            Response::ok(json!({"transactions": {"booked": booked, "pending": []}}))
        }

        // TrueLayer
        ("POST", ["connect", "token"]) => tl_token(req, config),
        ("GET", ["api", "providers"]) => Response::ok(json!([
            {"provider_id": "mock-gb", "display_name": "Mock Bank GB", "country": "GB", "logo_url": null},
            {"provider_id": "ob-natwest", "display_name": "NatWest", "country": "GB", "logo_url": "https://example.test/natwest.svg"},
            {"provider_id": "xs2a-fr", "display_name": "Banque FR", "country": "FR"},
        ])),
        ("DELETE", ["api", "delete"]) => Response::ok(json!({"success": true})),
        ("GET", ["data", "v1", ..]) if req.bearer() != Some(TL_ACCESS_TOKEN) || config.consent_revoked => {
            Response::status(401, json!({"error": "invalid_token", "error_description": "Access token expired"}))
        }
        ("GET", ["data", "v1", "me"]) => Response::ok(json!({"results": [{
            "client_id": "client",
            "credentials_id": "cred",
            "consent_status": "Authorised",
            "consent_expires_at": (Utc::now() + Duration::days(90)).to_rfc3339(),
        }]})),
        ("GET", ["data", "v1", "accounts"]) => Response::ok(json!({"results": [
            {"account_id": "tl-acc-1", "display_name": "Current Account", "currency": "GBP",
             "account_number": {"iban": "GB33BUKB20201555555555", "number": "55555555", "sort_code": "20-20-15"}},
        ]})),
        ("GET", ["data", "v1", "cards"]) => Response::ok(json!({"results": [
            {"account_id": "tl-card-1", "display_name": "Credit Card", "currency": "GBP", "card_type": "CREDIT"},
        ]})),
        ("GET", ["data", "v1", kind @ ("accounts" | "cards"), id, "transactions"]) => {
            if config.rate_limit {
                return Response::rate_limited();
            }
            let (from, to) = window(req, "from", "to");
            let card = *kind == "cards";
            let mut results: Vec<JsonValue> = (0..config.transactions_per_account)
                .map(|i| {
                    let debit = i % 2 == 0;
                    // Cards report debits as positive amounts
                    let amount = match (debit, card) {
                        (true, true) => json!(12.5 + i as f64),
                        (true, false) => json!(-(12.5 + i as f64)),
                        (false, _) => json!(50 + i),
                    };
                    json!({
                        "transaction_id": format!("{}-{}", id, i),
                        "timestamp": format!("{}T10:00:00+00:00", spread(from, to, i)),
                        "description": format!("PAYMENT {}", i),
                        "amount": amount,
                        "currency": "GBP",
                        "transaction_type": if debit { "DEBIT" } else { "CREDIT" },
                        "merchant_name": if debit { Some(format!("Shop {}", i)) } else { None },
                        "meta": {"provider_reference": format!("PR-{}-{}", id, i)},
                    })
                })
                .collect();
            results.extend((0..config.malformed_transactions).map(|i| {
                json!({
                    "transaction_id": format!("{}-broken-{}", id, i),
                    "timestamp": "yesterday",
                    "amount": -1,
                    "currency": "GBP",
                })
            }));
            Response::ok(json!({"results": results}))
        }

        _ => Response::status(404, json!({"error": "Endpoint not found"})),
    }
}

fn is_gocardless_resource(segment: &str) -> bool {
    matches!(segment, "institutions" | "agreements" | "requisitions" | "accounts")
}

fn gc_new_token(req: &Request) -> Response {
    let body: JsonValue = serde_json::from_str(&req.body).unwrap_or(JsonValue::Null);
    if body["secret_id"] == "valid_id" && body["secret_key"] == "valid_key" {
        Response::ok(json!({
            "access": GC_ACCESS_TOKEN,
            "access_expires": 86400,
            "refresh": "gc-refresh",
            "refresh_expires": 2_592_000,
        }))
    } else {
        Response::status(
            401,
            json!({"summary": "Authentication failed", "detail": "No active account found with the given credentials", "status_code": 401}),
        )
    }
}

fn gc_access_expired() -> Response {
    Response::status(
        409,
        json!({"summary": "EUA has expired", "detail": "End User Agreement has expired", "status_code": 409}),
    )
}

fn gc_institutions(req: &Request) -> Response {
    let country = req.query.get("country").map(|c| c.to_ascii_uppercase()).unwrap_or_default();
    let all = [
        ("SANDBOXFINANCE_SFIN0000", "Sandbox Finance", "DE", "540"),
        ("SPARKASSE_KOELN_COLSDE33", "Sparkasse KölnBonn", "DE", "730"),
        ("REVOLUT_REVOGB21", "Revolut", "GB", "730"),
    ];
    let list: Vec<JsonValue> = all
        .iter()
        .filter(|(_, _, c, _)| country.is_empty() || *c == country)
        .map(|(id, name, c, days)| {
            json!({"id": id, "name": name, "bic": "", "countries": [c], "transaction_total_days": days, "logo": null})
        })
        .collect();
    Response::ok(JsonValue::Array(list))
}

fn tl_token(req: &Request, config: &MockBankConfig) -> Response {
    let form = req.form();
    let granted = match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => form.get("code").map(String::as_str) == Some(TL_GOOD_CODE),
        Some("refresh_token") => !config.fail_refresh,
        _ => false,
    };
    if granted {
        Response::ok(json!({
            "access_token": TL_ACCESS_TOKEN,
            "refresh_token": "tl-refresh-2",
            "expires_in": 3600,
            "token_type": "Bearer",
        }))
    } else {
        Response::status(400, json!({"error": "invalid_grant"}))
    }
}

fn window(req: &Request, from_key: &str, to_key: &str) -> (NaiveDate, NaiveDate) {
    let today = Utc::now().date_naive();
    let parse = |key: &str| {
        req.query
            .get(key)
            .and_then(|v| NaiveDate::parse_from_str(&v[..v.len().min(10)], "%Y-%m-%d").ok())
    };
    let to = parse(to_key).unwrap_or(today);
    let from = parse(from_key).unwrap_or(to - Duration::days(30));
    (from, to)
}

/// i-th day of the window, clamped to its end
fn spread(from: NaiveDate, to: NaiveDate, i: usize) -> NaiveDate {
    (from + Duration::days(i as i64)).min(to)
}

fn send_response(stream: &mut TcpStream, response: Response) {
    let body = response.body.to_string();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        reason(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body.as_bytes());
    let _ = stream.flush();
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        409 => "Conflict",
        429 => "Too Many Requests",
        _ => "Error",
    }
}
