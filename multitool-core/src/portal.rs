//! Provisioning portal served on the setup access point.
//!
//! Two routes: `GET /` returns the credential form, `POST /save` takes the
//! url-encoded form and hands the credentials to the link manager. Anything
//! else is redirected to the form by answering it with the form itself, which
//! is what phones probing for a captive portal expect.

use heapless::String as HString;

use crate::http::{Method, Request, Response};
use crate::settings::{WifiCredentials, VALUE_LEN};

pub const SETUP_SSID: &str = "Multitool-Setup";
pub const SETUP_ADDRESS: [u8; 4] = [192, 168, 4, 1];

const FORM: &str = "<!DOCTYPE html><html><head><meta name=viewport content=\"width=device-width\">\
<title>Multitool setup</title></head><body><h3>Multitool WiFi setup</h3>\
<form method=post action=/save>SSID<br><input name=ssid maxlength=32><br>\
Password<br><input name=pass type=password maxlength=63><br><br>\
<input type=submit value=Save></form></body></html>";

const SAVED: &str = "<!DOCTYPE html><html><body><h3>Saved</h3>\
<p>The multitool is joining the network. This access point will close.</p></body></html>";

/// Answer one portal request. Returns credentials when the form was submitted
/// with a usable SSID.
pub fn handle(req: &Request<'_>) -> (Response, Option<WifiCredentials>) {
    match (req.method, req.path) {
        (Method::Post, "/save") => match parse_form(req.body) {
            Some(creds) => {
                log::info!("portal: credentials received for {}", creds.ssid);
                (Response::html(200, SAVED), Some(creds))
            }
            None => (Response::text(400, "SSID required"), None),
        },
        _ => (Response::html(200, FORM), None),
    }
}

fn parse_form(body: &[u8]) -> Option<WifiCredentials> {
    let body = core::str::from_utf8(body).ok()?;
    let ssid = form_value(body, "ssid")?;
    if ssid.is_empty() {
        return None;
    }
    let password = form_value(body, "pass").unwrap_or_default();
    Some(WifiCredentials { ssid, password })
}

/// Decoded value of `key` in an `application/x-www-form-urlencoded` body.
pub fn form_value(body: &str, key: &str) -> Option<HString<VALUE_LEN>> {
    let raw = body
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)?
        .1;
    decode(raw)
}

fn decode(raw: &str) -> Option<HString<VALUE_LEN>> {
    let mut bytes: heapless::Vec<u8, VALUE_LEN> = heapless::Vec::new();
    let mut it = raw.bytes();
    while let Some(b) = it.next() {
        let out = match b {
            b'+' => b' ',
            b'%' => {
                let hi = hex(it.next()?)?;
                let lo = hex(it.next()?)?;
                hi << 4 | lo
            }
            other => other,
        };
        bytes.push(out).ok()?;
    }
    HString::from_utf8(bytes).ok()
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(body: &str) -> std::vec::Vec<u8> {
        format!(
            concat!(
                "POST /save HTTP/1.1\r\n",
                "Content-Type: application/x-www-form-urlencoded\r\n",
                "Content-Length: {}\r\n\r\n{}",
            ),
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn form_values_are_percent_decoded() {
        let v = form_value("ssid=My+Home%21&pass=a%26b", "ssid").unwrap();
        assert_eq!(v.as_str(), "My Home!");
        assert_eq!(form_value("ssid=x&pass=a%26b", "pass").unwrap().as_str(), "a&b");
        assert!(form_value("ssid=x", "pass").is_none());
        assert!(form_value("ssid=%4", "ssid").is_none());
    }

    #[test]
    fn submitted_form_yields_credentials() {
        let raw = post("ssid=lab&pass=hunter22");
        let req = Request::parse(&raw).unwrap();
        let (resp, creds) = handle(&req);
        assert_eq!(resp.status(), 200);
        let creds = creds.unwrap();
        assert_eq!(creds.ssid.as_str(), "lab");
        assert_eq!(creds.password.as_str(), "hunter22");
    }

    #[test]
    fn empty_ssid_is_refused() {
        let raw = post("ssid=&pass=x");
        let req = Request::parse(&raw).unwrap();
        let (resp, creds) = handle(&req);
        assert_eq!(resp.status(), 400);
        assert!(creds.is_none());
    }

    #[test]
    fn any_other_path_serves_the_form() {
        let req = Request::parse(b"GET /generate_204 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let (resp, creds) = handle(&req);
        assert_eq!(resp.content_type(), "text/html");
        assert!(resp.body().contains("<form"));
        assert!(creds.is_none());
    }
}
