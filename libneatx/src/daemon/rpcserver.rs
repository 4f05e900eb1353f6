// Copyright 2024 Neatx Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The node daemon's local RPC listener (§4.5 "Local RPC"): accepts
//! connections on the session's Unix socket and dispatches each decoded
//! [`Request`] to a [`RpcHandler`], writing back the JSON+NUL-framed
//! [`Response`].

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use anyhow::Context;
use neatx_protocol::rpc::{self, AttachArgs, Command, ParamMap, Request, Response, RpcError};
use serde_json::Value;

/// The node daemon's command surface, implemented by whatever owns the
/// session's live state (the supervisor, the store). Kept as a trait so
/// the dispatch loop can be exercised against a fake in tests.
pub trait RpcHandler {
    fn start(&mut self, params: ParamMap) -> Result<Value, RpcError>;
    fn attach(&mut self, args: AttachArgs) -> Result<Value, RpcError>;
    fn restore(&mut self, params: ParamMap) -> Result<Value, RpcError>;
    fn terminate(&mut self) -> Result<Value, RpcError>;
    fn get_shadow_cookie(&mut self) -> Result<Value, RpcError>;
}

/// Binds the session's RPC socket, removing a stale file left behind by a
/// prior daemon instance first.
pub fn bind(socket_path: &Path) -> anyhow::Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {socket_path:?}"))?;
    }
    UnixListener::bind(socket_path).with_context(|| format!("binding socket {socket_path:?}"))
}

/// Serves requests on one accepted connection until the peer closes it or
/// sends a malformed request. Each request is fully handled before the
/// next is read, matching the daemon's single-session, single-client RPC
/// surface.
pub fn serve_connection(stream: &mut UnixStream, handler: &mut dyn RpcHandler) -> anyhow::Result<()> {
    loop {
        let request: Request = match rpc::decode_from(stream)? {
            Some(req) => req,
            None => return Ok(()),
        };

        let response = dispatch(handler, request);
        rpc::encode_to(stream, &response)?;
    }
}

fn dispatch(handler: &mut dyn RpcHandler, request: Request) -> Response {
    let Some(cmd) = Command::parse(&request.cmd) else {
        return Response::err(&RpcError::Generic(format!("unrecognized command: {}", request.cmd)));
    };

    let outcome = match cmd {
        Command::Start => parse_params(request.args).and_then(|p| handler.start(p)),
        Command::Restore => parse_params(request.args).and_then(|p| handler.restore(p)),
        Command::Attach => serde_json::from_value::<AttachArgs>(request.args)
            .map_err(|e| RpcError::Generic(e.to_string()))
            .and_then(|args| handler.attach(args)),
        Command::Terminate => handler.terminate(),
        Command::GetShadowCookie => handler.get_shadow_cookie(),
    };

    match outcome {
        Ok(result) => Response::ok(result),
        Err(err) => Response::err(&err),
    }
}

fn parse_params(value: Value) -> Result<ParamMap, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::Generic(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::thread;

    struct FakeHandler {
        started_with: Option<ParamMap>,
        terminate_calls: u32,
    }

    impl RpcHandler for FakeHandler {
        fn start(&mut self, params: ParamMap) -> Result<Value, RpcError> {
            self.started_with = Some(params);
            Ok(serde_json::json!({"display": 42}))
        }
        fn attach(&mut self, args: AttachArgs) -> Result<Value, RpcError> {
            if args.shadow_cookie.is_none() {
                return Err(RpcError::SessionParameter("shadow_cookie".to_string()));
            }
            Ok(Value::Bool(true))
        }
        fn restore(&mut self, _params: ParamMap) -> Result<Value, RpcError> {
            Ok(Value::Bool(true))
        }
        fn terminate(&mut self) -> Result<Value, RpcError> {
            self.terminate_calls += 1;
            Ok(Value::Null)
        }
        fn get_shadow_cookie(&mut self) -> Result<Value, RpcError> {
            Ok(Value::String("cookie123".to_string()))
        }
    }

    #[test]
    fn start_request_round_trips_and_reaches_handler() {
        let (mut client, mut server) = StdUnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            let mut handler = FakeHandler { started_with: None, terminate_calls: 0 };
            serve_connection(&mut server, &mut handler).unwrap();
            handler
        });

        let mut params = ParamMap::new();
        params.insert("client".to_string(), "unknown".to_string());
        let req = Request::new(Command::Start, serde_json::to_value(&params).unwrap());
        rpc::encode_to(&mut client, &req).unwrap();
        let resp: Response = rpc::decode_from(&mut client).unwrap().unwrap();
        assert!(resp.success);
        assert_eq!(resp.result["display"], 42);

        drop(client);
        let handler = server_thread.join().unwrap();
        assert_eq!(handler.started_with.unwrap().get("client").unwrap(), "unknown");
    }

    #[test]
    fn attach_without_shadow_cookie_returns_typed_error() {
        let (mut client, mut server) = StdUnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            let mut handler = FakeHandler { started_with: None, terminate_calls: 0 };
            serve_connection(&mut server, &mut handler).unwrap();
        });

        let args = AttachArgs { params: ParamMap::new(), shadow_cookie: None };
        let req = Request::new(Command::Attach, serde_json::to_value(&args).unwrap());
        rpc::encode_to(&mut client, &req).unwrap();
        let resp: Response = rpc::decode_from(&mut client).unwrap().unwrap();
        assert!(!resp.success);
        assert_eq!(RpcError::from_wire(&resp.result), RpcError::SessionParameter("shadow_cookie".to_string()));

        drop(client);
        server_thread.join().unwrap();
    }

    #[test]
    fn unrecognized_command_is_a_generic_error() {
        let (mut client, mut server) = StdUnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            let mut handler = FakeHandler { started_with: None, terminate_calls: 0 };
            serve_connection(&mut server, &mut handler).unwrap();
        });

        let req = Request { cmd: "reboot".to_string(), args: Value::Null };
        rpc::encode_to(&mut client, &req).unwrap();
        let resp: Response = rpc::decode_from(&mut client).unwrap().unwrap();
        assert!(!resp.success);

        drop(client);
        server_thread.join().unwrap();
    }

    #[test]
    fn multiple_requests_on_one_connection_are_all_served() {
        let (mut client, mut server) = StdUnixStream::pair().unwrap();
        let server_thread = thread::spawn(move || {
            let mut handler = FakeHandler { started_with: None, terminate_calls: 0 };
            serve_connection(&mut server, &mut handler).unwrap();
            handler
        });

        for _ in 0..3 {
            let req = Request::new(Command::Terminate, Value::Null);
            rpc::encode_to(&mut client, &req).unwrap();
            let _resp: Response = rpc::decode_from(&mut client).unwrap().unwrap();
        }

        drop(client);
        let handler = server_thread.join().unwrap();
        assert_eq!(handler.terminate_calls, 3);
    }
}
