// SOAP transport for the session service: SessionCreateRQ / SessionCloseRQ envelopes over HTTP

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::reader::Reader;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

use crate::error::{NetworkError, PoolError, SessionError};
use crate::session::{Identity, RemoteFault, Session};
use crate::transport::SessionTransport;

pub const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const EBXML_NS: &str = "http://www.ebxml.org/namespaces/messageHeader";
pub const WSSE_NS: &str = "http://schemas.xmlsoap.org/ws/2002/12/secext";

const SESSION_CREATE_ACTION: &str = "SessionCreateRQ";
const SESSION_CLOSE_ACTION: &str = "SessionCloseRQ";

// What we care about in a session service reply
#[derive(Debug, Default, PartialEq)]
pub struct SoapReply {
    pub security_token: Option<String>,
    pub conversation_id: Option<String>,
    pub fault: Option<RemoteFault>,
}

// ebXML routing values repeated in every message header
#[derive(Debug, Clone, Default)]
struct Routing {
    from_party: String,
    to_party: String,
    organization: String,
    conversation_id: String,
}

impl From<&Identity> for Routing {
    fn from(identity: &Identity) -> Self {
        Self {
            from_party: identity.from_party.clone(),
            to_party: identity.to_party.clone(),
            organization: identity.organization.clone(),
            conversation_id: identity.conversation_id.clone(),
        }
    }
}

pub struct SoapTransport {
    client: reqwest::Client,
    timeout: Duration,
    routing: Routing,
}

impl SoapTransport {
    pub fn new(timeout: Duration, identity: &Identity) -> Result<Self, PoolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoolError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            timeout,
            routing: Routing::from(identity),
        })
    }

    async fn post(
        &self,
        service_url: &str,
        action: &str,
        envelope: String,
    ) -> Result<SoapReply, NetworkError> {
        debug!(service_url, action, "Posting SOAP request");

        let response = self
            .client
            .post(service_url)
            .header(CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", action)
            .body(envelope)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        classify_body(status, &body)
    }

    fn classify(&self, error: reqwest::Error) -> NetworkError {
        if error.is_timeout() {
            NetworkError::Timeout(self.timeout.as_millis() as u64)
        } else {
            NetworkError::Request(error.to_string())
        }
    }
}

#[async_trait]
impl SessionTransport for SoapTransport {
    async fn create_session(
        &self,
        service_url: &str,
        identity: &Identity,
    ) -> Result<Session, NetworkError> {
        let envelope = session_create_envelope(identity);
        let reply = self
            .post(service_url, SESSION_CREATE_ACTION, envelope)
            .await?;

        if let Some(fault) = reply.fault {
            let id = reply
                .security_token
                .or(reply.conversation_id)
                .unwrap_or_default();
            return Ok(Session::faulted(id, fault));
        }

        match reply.security_token {
            Some(token) if !token.is_empty() => Ok(Session::new(token)),
            _ => Err(NetworkError::MalformedBody(
                "reply carries neither a BinarySecurityToken nor a Fault".to_string(),
            )),
        }
    }

    async fn close_session(&self, service_url: &str, session: &Session) -> Result<(), SessionError> {
        let envelope = session_close_envelope(&self.routing, session);
        let reply = self
            .post(service_url, SESSION_CLOSE_ACTION, envelope)
            .await?;

        match reply.fault {
            Some(fault) => Err(SessionError::Fault(fault)),
            None => Ok(()),
        }
    }
}

// Faults often come back with HTTP 500, so a fault in the body wins over the status.
// Any other reply behind a non-2xx status is a failed exchange.
pub fn classify_body(status: u16, body: &str) -> Result<SoapReply, NetworkError> {
    let success = (200..300).contains(&status);
    match parse_reply(body) {
        Ok(reply) if reply.fault.is_some() || success => Ok(reply),
        Ok(_) => Err(NetworkError::Status(status)),
        Err(_) if !success => Err(NetworkError::Status(status)),
        Err(e) => Err(e),
    }
}

pub fn parse_reply(body: &str) -> Result<SoapReply, NetworkError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut reply = SoapReply::default();
    let mut seen_envelope = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Envelope" => seen_envelope = true,
                b"Fault" => reply.fault = Some(RemoteFault::default()),
                b"BinarySecurityToken" => {
                    reply.security_token = Some(read_text(&mut reader, e.name())?);
                }
                b"ConversationId" => {
                    reply.conversation_id = Some(read_text(&mut reader, e.name())?);
                }
                b"faultcode" => {
                    let code = read_text(&mut reader, e.name())?;
                    if let Some(fault) = reply.fault.as_mut() {
                        fault.code = code;
                    }
                }
                b"faultstring" => {
                    let message = read_text(&mut reader, e.name())?;
                    if let Some(fault) = reply.fault.as_mut() {
                        fault.message = message;
                    }
                }
                _ => (),
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(NetworkError::MalformedBody(format!(
                    "error at position {}: {}",
                    reader.error_position(),
                    e
                )))
            }
            _ => (),
        }
    }

    if !seen_envelope {
        return Err(NetworkError::MalformedBody(
            "missing SOAP envelope".to_string(),
        ));
    }
    Ok(reply)
}

fn read_text(reader: &mut Reader<&[u8]>, end: QName) -> Result<String, NetworkError> {
    reader
        .read_text(end)
        .map(|text| text.trim().to_string())
        .map_err(|e| NetworkError::MalformedBody(e.to_string()))
}

fn message_header(routing: &Routing, action: &str) -> String {
    let now = Utc::now();
    let message_id = format!(
        "mid:{}-{}@{}",
        now.format("%Y%m%d-%H%M%S"),
        rand::random::<u32>(),
        escape(routing.from_party.as_str())
    );

    format!(
        r#"<eb:MessageHeader xmlns:eb="{ns}" soap-env:mustUnderstand="1" eb:version="1.0"><eb:From><eb:PartyId>{from}</eb:PartyId></eb:From><eb:To><eb:PartyId>{to}</eb:PartyId></eb:To><eb:CPAId>{cpa}</eb:CPAId><eb:ConversationId>{conversation}</eb:ConversationId><eb:Service>{action}</eb:Service><eb:Action>{action}</eb:Action><eb:MessageData><eb:MessageId>{message_id}</eb:MessageId><eb:Timestamp>{timestamp}</eb:Timestamp></eb:MessageData></eb:MessageHeader>"#,
        ns = EBXML_NS,
        from = escape(routing.from_party.as_str()),
        to = escape(routing.to_party.as_str()),
        cpa = escape(routing.organization.as_str()),
        conversation = escape(routing.conversation_id.as_str()),
        action = action,
        message_id = message_id,
        timestamp = now.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

fn envelope(header: &str, security: &str, body: &str) -> String {
    format!(
        r#"<soap-env:Envelope xmlns:soap-env="{ns}"><soap-env:Header>{header}{security}</soap-env:Header><soap-env:Body>{body}</soap-env:Body></soap-env:Envelope>"#,
        ns = SOAP_ENV_NS,
        header = header,
        security = security,
        body = body,
    )
}

pub fn session_create_envelope(identity: &Identity) -> String {
    let routing = Routing::from(identity);
    let security = format!(
        r#"<wsse:Security xmlns:wsse="{ns}"><wsse:UsernameToken><wsse:Username>{username}</wsse:Username><wsse:Password>{password}</wsse:Password><Organization>{organization}</Organization><Domain>{domain}</Domain></wsse:UsernameToken></wsse:Security>"#,
        ns = WSSE_NS,
        username = escape(identity.username.as_str()),
        password = escape(identity.password.as_str()),
        organization = escape(identity.organization.as_str()),
        domain = escape(identity.domain.as_str()),
    );
    let body = format!(
        r#"<SessionCreateRQ><POS><Source PseudoCityCode="{}"/></POS></SessionCreateRQ>"#,
        escape(identity.organization.as_str())
    );

    envelope(
        &message_header(&routing, SESSION_CREATE_ACTION),
        &security,
        &body,
    )
}

fn session_close_envelope(routing: &Routing, session: &Session) -> String {
    let security = format!(
        r#"<wsse:Security xmlns:wsse="{ns}"><wsse:BinarySecurityToken>{token}</wsse:BinarySecurityToken></wsse:Security>"#,
        ns = WSSE_NS,
        token = escape(session.id()),
    );
    let body = format!(
        r#"<SessionCloseRQ><POS><Source PseudoCityCode="{}"/></POS></SessionCloseRQ>"#,
        escape(routing.organization.as_str())
    );

    envelope(
        &message_header(routing, SESSION_CLOSE_ACTION),
        &security,
        &body,
    )
}

// A small create reply for inline testing
pub const SESSION_CREATE_RS: &str = r#"
<soap-env:Envelope xmlns:soap-env="http://schemas.xmlsoap.org/soap/envelope/">
  <soap-env:Header>
    <eb:MessageHeader xmlns:eb="http://www.ebxml.org/namespaces/messageHeader" eb:version="1.0" soap-env:mustUnderstand="1">
      <eb:ConversationId>conv-42</eb:ConversationId>
      <eb:Action>SessionCreateRS</eb:Action>
    </eb:MessageHeader>
    <wsse:Security xmlns:wsse="http://schemas.xmlsoap.org/ws/2002/12/secext">
      <wsse:BinarySecurityToken valueType="String" EncodingType="wsse:Base64Binary">Shared/IDL:IceSess\/SessMgr:1\.0.IDL/Common/!ICESMS\/ACPCRTC!ICESMSLB\/CRT.LB!-3142!0!0</wsse:BinarySecurityToken>
    </wsse:Security>
  </soap-env:Header>
  <soap-env:Body>
    <SessionCreateRS status="Approved">
      <ConversationId>conv-42</ConversationId>
    </SessionCreateRS>
  </soap-env:Body>
</soap-env:Envelope>
"#;

// A fault reply for inline testing
pub const SESSION_FAULT_RS: &str = r#"
<soap-env:Envelope xmlns:soap-env="http://schemas.xmlsoap.org/soap/envelope/">
  <soap-env:Header>
    <eb:MessageHeader xmlns:eb="http://www.ebxml.org/namespaces/messageHeader" eb:version="1.0" soap-env:mustUnderstand="1">
      <eb:ConversationId>conv-42</eb:ConversationId>
      <eb:Action>ErrorRS</eb:Action>
    </eb:MessageHeader>
  </soap-env:Header>
  <soap-env:Body>
    <soap-env:Fault>
      <faultcode>soap-env:Client.AuthenticationFailed</faultcode>
      <faultstring>Authentication failed</faultstring>
      <detail>
        <StackTrace>com.example.universalservices.base.security.AuthenticationException</StackTrace>
      </detail>
    </soap-env:Fault>
  </soap-env:Body>
</soap-env:Envelope>
"#;
