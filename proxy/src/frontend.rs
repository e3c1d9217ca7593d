//! Client-facing LDAP listener
//!
//! Frames LDAP messages with `ldap3_proto`, dispatches each operation to a
//! [`Handler`] and writes the responses back in arrival order. One task per
//! client connection.

use crate::error::RelayResult;
use crate::handler::Handler;
use crate::proto::{Attribute, Control, DerefAliases, Entry, ResultCode, Scope, SearchRequest};
use crate::session::ClientConn;
use futures::{SinkExt, StreamExt};
use ldap3::asn1::{parse_tag, parse_uint};
use ldap3::controls::{ManageDsaIt, PagedResults, RawControl};
use ldap3::ldap_escape;
use ldap3_proto::control::LdapControl;
use ldap3_proto::proto::{
    LdapBindCred, LdapBindRequest, LdapBindResponse, LdapExtendedResponse, LdapFilter,
    LdapMatchingRuleAssertion, LdapMsg, LdapOp, LdapPartialAttribute, LdapResult, LdapResultCode,
    LdapSearchRequest, LdapSearchResultEntry, LdapSearchResultReference, LdapSearchScope,
};
use ldap3_proto::LdapCodec;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Simple paged results (RFC 2696)
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
const PASSWORD_POLICY_OID: &str = "1.3.6.1.4.1.42.2.27.8.5.1";

/// Pause after an accept error that is not about a single connection
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept client connections. Accept errors are logged and never end the loop.
pub async fn serve(listener: TcpListener, handler: Arc<dyn Handler>) -> RelayResult<()> {
    info!("LDAP frontend listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept client connection");
                if let Some(backoff) = accept_backoff(&e) {
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }
        };
        debug!(src = %peer, "accepted client connection");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, handler).await {
                warn!(src = %peer, error = %e, "client connection ended with error");
            }
        });
    }
}

/// How long to wait before accepting again.
///
/// Errors tied to one aborted connection retry at once; anything else (out of
/// file descriptors, out of memory) waits so the loop does not spin.
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Serve one client connection to completion.
///
/// The handler's `close` runs however the connection ends.
pub async fn handle_client(stream: TcpStream, handler: Arc<dyn Handler>) -> RelayResult<()> {
    let conn = ClientConn::new(stream.local_addr()?, stream.peer_addr()?);
    let mut framed = Framed::new(stream, LdapCodec::default());
    let mut bound_dn = String::new();

    let outcome = loop {
        let msg = match framed.next().await.transpose() {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(src = %conn, "client closed connection");
                break Ok(());
            }
            Err(e) => {
                debug!(src = %conn, error = %e, "read error");
                break Ok(());
            }
        };

        let replies = match dispatch(handler.as_ref(), &conn, &mut bound_dn, msg).await {
            Some(replies) => replies,
            None => break Ok(()),
        };

        let mut sent = Ok(());
        for reply in replies {
            if let Err(e) = framed.send(reply).await {
                sent = Err(e);
                break;
            }
        }
        if let Err(e) = sent {
            error!(src = %conn, error = %e, "write error");
            break Err(e.into());
        }
    };

    handler.close(&bound_dn, &conn).await;
    outcome
}

fn reply(msgid: i32, op: LdapOp) -> LdapMsg {
    LdapMsg {
        msgid,
        op,
        ctrl: vec![],
    }
}

/// Responses for one request; `None` ends the connection
async fn dispatch(
    handler: &dyn Handler,
    conn: &ClientConn,
    bound_dn: &mut String,
    msg: LdapMsg,
) -> Option<Vec<LdapMsg>> {
    let LdapMsg { msgid, op, ctrl } = msg;
    let op = match op {
        LdapOp::BindRequest(request) => do_bind(handler, conn, bound_dn, &request).await,
        LdapOp::SearchRequest(request) => {
            return Some(do_search(handler, conn, bound_dn, msgid, &request, &ctrl).await)
        }
        LdapOp::UnbindRequest => return None,
        LdapOp::AddRequest(_) => {
            LdapOp::AddResponse(make_result(handler.add(bound_dn, conn).await, ""))
        }
        LdapOp::ModifyRequest(_) => {
            LdapOp::ModifyResponse(make_result(handler.modify(bound_dn, conn).await, ""))
        }
        LdapOp::DelRequest(_) => {
            LdapOp::DelResponse(make_result(handler.delete(bound_dn, conn).await, ""))
        }
        op => LdapOp::ExtendedResponse(LdapExtendedResponse {
            res: make_result_code(
                LdapResultCode::UnwillingToPerform,
                &format!("Unsupported operation: {:?}", op),
            ),
            name: None,
            value: None,
        }),
    };
    Some(vec![reply(msgid, op)])
}

async fn do_bind(
    handler: &dyn Handler,
    conn: &ClientConn,
    bound_dn: &mut String,
    request: &LdapBindRequest,
) -> LdapOp {
    #[allow(unreachable_patterns)]
    let code = match &request.cred {
        LdapBindCred::Simple(password) => handler.bind(&request.dn, password, conn).await,
        _ => ResultCode::UnwillingToPerform,
    };

    if code.is_success() {
        *bound_dn = request.dn.clone();
    }

    LdapOp::BindResponse(LdapBindResponse {
        res: make_result(code, ""),
        saslcreds: None,
    })
}

async fn do_search(
    handler: &dyn Handler,
    conn: &ClientConn,
    bound_dn: &str,
    msgid: i32,
    request: &LdapSearchRequest,
    controls: &[LdapControl],
) -> Vec<LdapMsg> {
    let result = handler
        .search(bound_dn, convert_search(request, controls), conn)
        .await;

    let mut replies: Vec<LdapMsg> = result
        .entries
        .into_iter()
        .map(|entry| reply(msgid, LdapOp::SearchResultEntry(convert_entry(entry))))
        .collect();
    replies.extend(result.references.into_iter().map(|uri| {
        reply(
            msgid,
            LdapOp::SearchResultReference(LdapSearchResultReference { uris: vec![uri] }),
        )
    }));

    let mut done = make_result(result.code, "");
    if result.code == ResultCode::Referral {
        done.referral = result.referrals;
    }
    replies.push(LdapMsg {
        msgid,
        op: LdapOp::SearchResultDone(done),
        ctrl: result
            .controls
            .into_iter()
            .filter_map(response_control)
            .collect(),
    });
    replies
}

/// Client search request as a relay request
pub fn convert_search(request: &LdapSearchRequest, controls: &[LdapControl]) -> SearchRequest {
    let scope = match request.scope {
        LdapSearchScope::Base => Scope::Base,
        LdapSearchScope::OneLevel => Scope::OneLevel,
        // Children is widened to a subtree search
        LdapSearchScope::Subtree | LdapSearchScope::Children => Scope::Subtree,
    };
    let deref_aliases = match request.aliases.clone() as i64 {
        1 => DerefAliases::InSearching,
        2 => DerefAliases::FindingBaseObject,
        3 => DerefAliases::Always,
        _ => DerefAliases::Never,
    };

    SearchRequest {
        base_dn: request.base.clone(),
        scope,
        deref_aliases,
        size_limit: request.sizelimit,
        time_limit: request.timelimit,
        types_only: request.typesonly,
        filter: render_filter(&request.filter),
        attributes: request.attrs.clone(),
        controls: controls.iter().filter_map(request_control).collect(),
    }
}

/// Render a filter in RFC 4515 string form with escaped values
pub fn render_filter(filter: &LdapFilter) -> String {
    match filter {
        LdapFilter::And(filters) => format!("(&{})", render_all(filters)),
        LdapFilter::Or(filters) => format!("(|{})", render_all(filters)),
        LdapFilter::Not(inner) => format!("(!{})", render_filter(inner)),
        LdapFilter::Equality(attr, value) => format!("({}={})", attr, ldap_escape(value.as_str())),
        LdapFilter::GreaterOrEqual(attr, value) => {
            format!("({}>={})", attr, ldap_escape(value.as_str()))
        }
        LdapFilter::LessOrEqual(attr, value) => {
            format!("({}<={})", attr, ldap_escape(value.as_str()))
        }
        LdapFilter::Approx(attr, value) => format!("({}~={})", attr, ldap_escape(value.as_str())),
        LdapFilter::Present(attr) => format!("({}=*)", attr),
        LdapFilter::Substring(attr, sub) => {
            let mut pattern = String::new();
            if let Some(initial) = &sub.initial {
                pattern.push_str(&ldap_escape(initial.as_str()));
            }
            pattern.push('*');
            for any in &sub.any {
                pattern.push_str(&ldap_escape(any.as_str()));
                pattern.push('*');
            }
            if let Some(last) = &sub.final_ {
                pattern.push_str(&ldap_escape(last.as_str()));
            }
            format!("({}={})", attr, pattern)
        }
        LdapFilter::Extensible(assertion) => render_extensible(assertion),
    }
}

fn render_all(filters: &[LdapFilter]) -> String {
    filters.iter().map(render_filter).collect()
}

/// `(attr:dn:rule:=value)`, each of attr, `:dn` and rule optional
fn render_extensible(assertion: &LdapMatchingRuleAssertion) -> String {
    let mut rendered = String::from("(");
    if let Some(attr) = &assertion.type_ {
        rendered.push_str(attr);
    }
    if assertion.dn_attributes {
        rendered.push_str(":dn");
    }
    if let Some(rule) = &assertion.matching_rule {
        rendered.push(':');
        rendered.push_str(rule);
    }
    rendered.push_str(":=");
    rendered.push_str(&ldap_escape(assertion.match_value.as_str()));
    rendered.push(')');
    rendered
}

/// Request control in relay form.
///
/// The codec keeps no value for controls it does not know, so those cannot be
/// forwarded faithfully and are dropped.
fn request_control(control: &LdapControl) -> Option<Control> {
    let raw = match control {
        LdapControl::SimplePagedResults { size, cookie } => RawControl::from(PagedResults {
            size: i32::try_from(*size).unwrap_or(i32::MAX),
            cookie: cookie.clone(),
        }),
        LdapControl::ManageDsaIT { criticality } => RawControl {
            crit: *criticality,
            ..RawControl::from(ManageDsaIt)
        },
        LdapControl::PasswordPolicyRequest { criticality } => RawControl {
            ctype: PASSWORD_POLICY_OID.to_string(),
            crit: *criticality,
            val: None,
        },
        other => {
            debug!(control = ?other, "request control not forwarded");
            return None;
        }
    };
    Some(Control {
        oid: raw.ctype,
        critical: raw.crit,
        value: raw.val,
    })
}

/// Upstream response control for the client. Value-less controls pass through
/// by OID; valued ones only when the codec can encode them.
fn response_control(control: Control) -> Option<LdapControl> {
    match (control.oid.as_str(), control.value.as_deref()) {
        (PAGED_RESULTS_OID, Some(value)) => match decode_paged_results(value) {
            Some((size, cookie)) => Some(LdapControl::SimplePagedResults { size, cookie }),
            None => {
                warn!("undecodable paged results control from upstream");
                None
            }
        },
        (_, None) => Some(LdapControl::Unknown { oid: control.oid }),
        (oid, Some(_)) => {
            debug!(oid, "response control not forwarded");
            None
        }
    }
}

/// `realSearchControlValue ::= SEQUENCE { size INTEGER, cookie OCTET STRING }`
fn decode_paged_results(value: &[u8]) -> Option<(i64, Vec<u8>)> {
    let (_, tag) = parse_tag(value).ok()?;
    let mut parts = tag.expect_constructed()?.into_iter();
    let size = parts.next()?.expect_primitive()?;
    let (_, size) = parse_uint(&size).ok()?;
    let cookie = parts.next()?.expect_primitive()?;
    Some((i64::try_from(size).ok()?, cookie))
}

fn convert_entry(entry: Entry) -> LdapSearchResultEntry {
    LdapSearchResultEntry {
        dn: entry.dn,
        attributes: entry
            .attributes
            .into_iter()
            .map(|Attribute { name, values }| LdapPartialAttribute {
                atype: name,
                vals: values,
            })
            .collect(),
    }
}

fn make_result(code: ResultCode, message: &str) -> LdapResult {
    make_result_code(ldap_result_code(code), message)
}

fn make_result_code(code: LdapResultCode, message: &str) -> LdapResult {
    LdapResult {
        code,
        matcheddn: "".to_string(),
        message: message.to_string(),
        referral: vec![],
    }
}

/// Wire result code with the same numeric value, `other` when the codec has none
fn ldap_result_code(code: ResultCode) -> LdapResultCode {
    LdapResultCode::try_from(i64::from(code.code())).unwrap_or_else(|_| {
        debug!(code = code.code(), "no wire result code for upstream code");
        LdapResultCode::Other
    })
}
