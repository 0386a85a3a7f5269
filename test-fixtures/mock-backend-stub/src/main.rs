//! Minimal mock backend for bustest integration tests.
//!
//! Accepts the command line python-dbusmock gets after the interpreter, so
//! it can be configured as the mock backend's `python`:
//!
//! Usage: `mock-backend-stub -m <module> [--system] <name> <path> <interface>`
//!
//! Serves the parts of `org.freedesktop.DBus.Mock` the harness drives:
//! - AddObject, AddProperty, AddMethod, UpdateProperties
//! - GetMethodCalls, ClearCalls
//! - EmitSignal (recorded in the log only, nothing is emitted)
//!
//! It also answers `org.freedesktop.DBus.Properties` Get/GetAll and calls to
//! mocked methods. Method behavior is limited to `""` and `ret = '<text>'`;
//! anything else is rejected by AddMethod.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use zbus::message::Type as MessageType;
use zbus::zvariant::{OwnedValue, Structure};
use zbus::{Connection, Message, MessageStream};

const MOCK_INTERFACE: &str = "org.freedesktop.DBus.Mock";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

struct Options {
    system: bool,
    name: String,
    path: String,
    interface: String,
}

fn parse_args() -> Result<Options, String> {
    let mut args = std::env::args().skip(1);
    let mut system = false;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-m" => {
                args.next().ok_or("-m needs a module name")?;
            }
            "--system" => system = true,
            other if other.starts_with('-') => return Err(format!("unknown option {other}")),
            other => positional.push(other.to_string()),
        }
    }

    let [name, path, interface]: [String; 3] = positional
        .try_into()
        .map_err(|_| "expected <name> <path> <interface>".to_string())?;
    Ok(Options {
        system,
        name,
        path,
        interface,
    })
}

/// An error reply: D-Bus error name plus message.
struct Rejection {
    name: &'static str,
    message: String,
}

impl Rejection {
    fn new(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }
}

impl From<zbus::Error> for Rejection {
    fn from(e: zbus::Error) -> Self {
        Self::new("org.freedesktop.DBus.Error.InvalidArgs", e.to_string())
    }
}

struct MockMethod {
    out_signature: String,
    ret: Option<String>,
}

struct RecordedCall {
    method: String,
    timestamp: u64,
    args: Vec<OwnedValue>,
}

struct MockObject {
    interface: String,
    properties: HashMap<String, HashMap<String, OwnedValue>>,
    methods: HashMap<(String, String), MockMethod>,
    calls: Vec<RecordedCall>,
}

impl MockObject {
    fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            properties: HashMap::new(),
            methods: HashMap::new(),
            calls: Vec::new(),
        }
    }

    /// An empty interface argument means the object's main interface.
    fn interface_or_main(&self, interface: String) -> String {
        if interface.is_empty() {
            self.interface.clone()
        } else {
            interface
        }
    }
}

/// `""` or `ret = '<text>'` / `ret = "<text>"`.
fn parse_behavior(code: &str) -> Result<Option<String>, String> {
    let code = code.trim();
    if code.is_empty() {
        return Ok(None);
    }
    let literal = code
        .strip_prefix("ret")
        .map(str::trim_start)
        .and_then(|rest| rest.strip_prefix('='))
        .map(str::trim)
        .ok_or_else(|| format!("unsupported behavior: {code}"))?;
    ['\'', '"']
        .into_iter()
        .find_map(|quote| {
            literal
                .strip_prefix(quote)
                .and_then(|rest| rest.strip_suffix(quote))
        })
        .map(|text| Some(text.to_string()))
        .ok_or_else(|| format!("unsupported return value: {literal}"))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn call_args(msg: &Message) -> Result<Vec<OwnedValue>, Rejection> {
    let header = msg.header();
    if header.signature().is_none_or(|signature| signature.as_str().is_empty()) {
        return Ok(Vec::new());
    }
    let body = msg.body();
    let fields: Structure<'_> = body.deserialize()?;
    fields
        .into_fields()
        .iter()
        .map(|field| field.try_to_owned().map_err(zbus::Error::from))
        .collect::<Result<_, _>>()
        .map_err(Rejection::from)
}

fn reply<B>(msg: &Message, body: &B) -> Result<Message, Rejection>
where
    B: serde::Serialize + zbus::zvariant::DynamicType,
{
    Ok(Message::method_reply(msg)?.build(body)?)
}

struct Backend {
    objects: HashMap<String, MockObject>,
}

impl Backend {
    fn new(path: &str, interface: &str) -> Self {
        Self {
            objects: HashMap::from([(path.to_string(), MockObject::new(interface))]),
        }
    }

    fn object(&mut self, path: &str) -> Result<&mut MockObject, Rejection> {
        self.objects.get_mut(path).ok_or_else(|| {
            Rejection::new(
                "org.freedesktop.DBus.Error.UnknownObject",
                format!("no object at {path}"),
            )
        })
    }

    fn handle(&mut self, msg: &Message) -> Result<Message, Rejection> {
        let header = msg.header();
        let path = header.path().map(|p| p.to_string()).unwrap_or_default();
        let interface = header.interface().map(|i| i.to_string()).unwrap_or_default();
        let member = header.member().map(|m| m.to_string()).unwrap_or_default();
        tracing::debug!(%path, %interface, %member, "call");

        match (interface.as_str(), member.as_str()) {
            (MOCK_INTERFACE, "AddObject") => {
                type Methods = Vec<(String, String, String, String)>;
                let (new_path, new_interface, properties, methods): (
                    String,
                    String,
                    HashMap<String, OwnedValue>,
                    Methods,
                ) = msg.body().deserialize()?;
                if self.objects.contains_key(&new_path) {
                    return Err(Rejection::new(
                        "org.freedesktop.DBus.Mock.NameError",
                        format!("object {new_path} already exists"),
                    ));
                }
                let mut object = MockObject::new(&new_interface);
                object.properties.insert(new_interface.clone(), properties);
                for (name, in_signature, out_signature, code) in methods {
                    let ret = parse_behavior(&code)
                        .map_err(|e| Rejection::new("org.freedesktop.DBus.Error.NotSupported", e))?;
                    tracing::debug!(%name, %in_signature, "method declared with object");
                    object.methods.insert(
                        (new_interface.clone(), name),
                        MockMethod { out_signature, ret },
                    );
                }
                self.objects.insert(new_path, object);
                reply(msg, &())
            }
            (MOCK_INTERFACE, "AddProperty") => {
                let (iface, name, value): (String, String, OwnedValue) = msg.body().deserialize()?;
                let object = self.object(&path)?;
                let iface = object.interface_or_main(iface);
                let properties = object.properties.entry(iface.clone()).or_default();
                if properties.contains_key(&name) {
                    return Err(Rejection::new(
                        "org.freedesktop.DBus.Mock.NameError",
                        format!("property {name} already exists on {iface}"),
                    ));
                }
                properties.insert(name, value);
                reply(msg, &())
            }
            (MOCK_INTERFACE, "AddMethod") => {
                let (iface, name, _in_signature, out_signature, code): (
                    String,
                    String,
                    String,
                    String,
                    String,
                ) = msg.body().deserialize()?;
                let ret = parse_behavior(&code)
                    .map_err(|e| Rejection::new("org.freedesktop.DBus.Error.NotSupported", e))?;
                let returns_text = out_signature == "s";
                if ret.is_some() != returns_text {
                    return Err(Rejection::new(
                        "org.freedesktop.DBus.Error.NotSupported",
                        format!("behavior does not fit out signature '{out_signature}'"),
                    ));
                }
                let object = self.object(&path)?;
                let iface = object.interface_or_main(iface);
                object
                    .methods
                    .insert((iface, name), MockMethod { out_signature, ret });
                reply(msg, &())
            }
            (MOCK_INTERFACE, "UpdateProperties") => {
                let (iface, changed): (String, HashMap<String, OwnedValue>) =
                    msg.body().deserialize()?;
                let object = self.object(&path)?;
                let iface = object.interface_or_main(iface);
                let properties = object.properties.entry(iface.clone()).or_default();
                if let Some(missing) = changed.keys().find(|name| !properties.contains_key(*name)) {
                    return Err(Rejection::new(
                        "org.freedesktop.DBus.Mock.NameError",
                        format!("property {missing} does not exist on {iface}"),
                    ));
                }
                properties.extend(changed);
                reply(msg, &())
            }
            (MOCK_INTERFACE, "EmitSignal") => {
                let (iface, name, signature, args): (String, String, String, Vec<OwnedValue>) =
                    msg.body().deserialize()?;
                self.object(&path)?;
                tracing::info!(%path, %iface, %name, %signature, args = args.len(), "signal requested");
                reply(msg, &())
            }
            (MOCK_INTERFACE, "GetMethodCalls") => {
                let (method,): (String,) = msg.body().deserialize()?;
                let object = self.object(&path)?;
                let calls: Vec<(u64, &[OwnedValue])> = object
                    .calls
                    .iter()
                    .filter(|call| call.method == method)
                    .map(|call| (call.timestamp, call.args.as_slice()))
                    .collect();
                reply(msg, &calls)
            }
            (MOCK_INTERFACE, "ClearCalls") => {
                self.object(&path)?.calls.clear();
                reply(msg, &())
            }
            (PROPERTIES_INTERFACE, "Get") => {
                let (iface, name): (String, String) = msg.body().deserialize()?;
                let object = self.object(&path)?;
                let iface = object.interface_or_main(iface);
                let value = object
                    .properties
                    .get(&iface)
                    .and_then(|properties| properties.get(&name))
                    .ok_or_else(|| {
                        Rejection::new(
                            "org.freedesktop.DBus.Error.UnknownProperty",
                            format!("no property {name} on {iface}"),
                        )
                    })?;
                reply(msg, value)
            }
            (PROPERTIES_INTERFACE, "GetAll") => {
                let (iface,): (String,) = msg.body().deserialize()?;
                let object = self.object(&path)?;
                let iface = object.interface_or_main(iface);
                match object.properties.get(&iface) {
                    Some(properties) => reply(msg, properties),
                    None => reply(msg, &HashMap::<String, OwnedValue>::new()),
                }
            }
            _ => self.call_mocked(msg, &path, interface, member),
        }
    }

    fn call_mocked(
        &mut self,
        msg: &Message,
        path: &str,
        interface: String,
        member: String,
    ) -> Result<Message, Rejection> {
        let args = call_args(msg)?;
        let object = self.object(path)?;
        let interface = object.interface_or_main(interface);
        let method = object.methods.get(&(interface.clone(), member.clone())).ok_or_else(|| {
            Rejection::new(
                "org.freedesktop.DBus.Error.UnknownMethod",
                format!("no method {member} on {interface}"),
            )
        })?;
        let response = match &method.ret {
            Some(text) => reply(msg, text),
            None => reply(msg, &()),
        };
        tracing::debug!(%member, out_signature = %method.out_signature, "mocked method called");
        object.calls.push(RecordedCall {
            method: member,
            timestamp: now_secs(),
            args,
        });
        response
    }
}

async fn run(options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let builder = if options.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let connection: Connection = builder.build().await?;
    // Subscribe before claiming the name so no early call is missed.
    let mut stream = MessageStream::from(&connection);
    connection.request_name(options.name.as_str()).await?;
    tracing::info!(name = %options.name, "mock backend ready");

    let mut backend = Backend::new(&options.path, &options.interface);
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        let msg = tokio::select! {
            _ = terminate.recv() => {
                tracing::info!("terminated");
                return Ok(());
            }
            next = stream.next() => match next {
                Some(msg) => msg?,
                None => return Ok(()),
            },
        };
        if msg.header().message_type() != MessageType::MethodCall {
            continue;
        }
        let response = match backend.handle(&msg) {
            Ok(response) => response,
            Err(rejection) => {
                tracing::debug!(error = rejection.name, message = %rejection.message, "rejected");
                Message::method_error(&msg, rejection.name)?.build(&(rejection.message,))?
            }
        };
        connection.send(&response).await?;
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("mock-backend-stub: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(options).await {
        tracing::error!(error = %e, "mock-backend-stub failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_behavior_literals() {
        assert_eq!(parse_behavior("").unwrap(), None);
        assert_eq!(parse_behavior("ret = 'test'").unwrap(), Some("test".to_string()));
        assert_eq!(parse_behavior("ret=\"x\"").unwrap(), Some("x".to_string()));
        assert!(parse_behavior("raise SystemError('no')").is_err());
        assert!(parse_behavior("ret = 42").is_err());
    }
}
