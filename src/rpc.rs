//! RPC service surface.
//!
//! Requests are JSON objects `{"method": "...", "params": [...]}`. Replies are
//! either `{"result": ...}` or `{"fault": {"code": n, "message": "..."}}`.
//!
//! The caller's address is checked against the [`AllowList`] before the body
//! is even decoded, so a denied caller can never reach the controller.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::controller::Controller;
use crate::error::RpcError;

/// Decoded request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Method name, e.g. `expose_start`.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Request {
    /// Request for `method` with `params`.
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Fault body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// See [`RpcError::code`].
    pub code: i32,
    /// Human readable reason.
    pub message: String,
}

/// Reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    /// Successful call.
    Result(Value),
    /// Failed call.
    Fault(Fault),
}

impl Response {
    /// The textual result, if this is a string reply.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Response::Result(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The fault body, if the call failed.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Response::Fault(f) => Some(f),
            Response::Result(_) => None,
        }
    }
}

impl From<RpcError> for Response {
    fn from(e: RpcError) -> Self {
        Response::Fault(Fault {
            code: e.code(),
            message: e.to_string(),
        })
    }
}

/// Exact-match list of client addresses.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    addrs: Vec<String>,
}

impl AllowList {
    /// Allow exactly `addrs`.
    pub fn new(addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
        }
    }

    /// IPv4-mapped IPv6 addresses match their IPv4 form.
    pub fn is_allowed(&self, peer: IpAddr) -> bool {
        let peer = match peer {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(peer, IpAddr::V4),
            v4 => v4,
        };
        let peer = peer.to_string();
        self.addrs.iter().any(|a| *a == peer)
    }
}

/// Dispatches requests from allowed callers to the controller.
#[derive(Clone)]
pub struct RpcService {
    controller: Controller,
    allow: AllowList,
}

impl RpcService {
    /// Service answering callers on `allow`.
    pub fn new(controller: Controller, allow: AllowList) -> Self {
        Self { controller, allow }
    }

    /// Controller requests are dispatched to.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Handle one encoded request from `peer`.
    pub async fn handle(&self, peer: IpAddr, body: &[u8]) -> Response {
        if !self.allow.is_allowed(peer) {
            warn!(%peer, "connection denied");
            return RpcError::PermissionDenied(peer.to_string()).into();
        }

        let request: Request = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(e) => return RpcError::Malformed(e.to_string()).into(),
        };
        debug!(%peer, method = %request.method, "rpc call");

        match self.dispatch(&request).await {
            Ok(value) => Response::Result(value),
            Err(e) => {
                warn!(%peer, method = %request.method, error = %e, "rpc fault");
                e.into()
            }
        }
    }

    async fn dispatch(&self, req: &Request) -> Result<Value, RpcError> {
        let ctl = &self.controller;
        let p = Params::new(&req.method, &req.params);
        let reply = match req.method.as_str() {
            "expose_set" => ctl.set_variable(p.str(0)?, p.str(1)?).await,
            "expose_get" => ctl.get_variable(p.str(0)?).await,
            "expose_set_key" => ctl.set_header_key(p.str(0)?, p.str(1)?, p.opt_str(2)?),
            "expose_get_key" => ctl.get_header_key(p.str(0)?),
            "expose_get_all_keys" => ctl.get_all_header_keys(),
            "expose_start" => ctl.start_exposure(p.int(0)?, p.int(1)?, p.int(2)?)?,
            "expose_time_update" => ctl.update_exptime(p.int(0)?)?,
            "expose_meter_update" => ctl.update_meter(p.int(0)?),
            "expose_add_time" => ctl.add_time(p.int(0)?),
            "expose_readout" => ctl.request_readout(),
            "expose_abort" => ctl.request_abort(),
            "expose_info" => {
                return serde_json::to_value(ctl.status())
                    .map_err(|e| RpcError::Malformed(e.to_string()));
            }
            other => return Err(RpcError::UnknownMethod(other.to_string())),
        };
        Ok(Value::String(reply))
    }
}

/// Positional parameter access with typed errors.
struct Params<'a> {
    method: &'a str,
    values: &'a [Value],
}

impl<'a> Params<'a> {
    fn new(method: &'a str, values: &'a [Value]) -> Self {
        Self { method, values }
    }

    fn missing(&self, index: usize) -> RpcError {
        RpcError::Malformed(format!("{} expects parameter {}", self.method, index + 1))
    }

    fn str(&self, index: usize) -> Result<&'a str, RpcError> {
        let value = self.values.get(index).ok_or_else(|| self.missing(index))?;
        value.as_str().ok_or_else(|| {
            RpcError::Malformed(format!("{} parameter {} must be a string", self.method, index + 1))
        })
    }

    fn opt_str(&self, index: usize) -> Result<&'a str, RpcError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(""),
            Some(_) => self.str(index),
        }
    }

    fn int(&self, index: usize) -> Result<i64, RpcError> {
        let value = self.values.get(index).ok_or_else(|| self.missing(index))?;
        value.as_i64().ok_or_else(|| {
            RpcError::Malformed(format!("{} parameter {} must be an integer", self.method, index + 1))
        })
    }
}
