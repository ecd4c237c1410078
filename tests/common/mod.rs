#![allow(dead_code)]

pub mod test_server {
    use std::sync::Once;

    /// Ensures May coroutines are configured only once
    static MAY_INIT: Once = Once::new();

    pub fn setup_may_runtime() {
        MAY_INIT.call_once(|| {
            may::config().set_stack_size(0x8000);
        });
    }
}

pub mod xml {
    //! Minimal flat XML codec: `<a>1</a><b>2</b>` <-> `{"a":"1","b":"2"}`.

    use brrtengine::content::{BodyParser, ContentSerializer};
    use brrtengine::response::Renderable;
    use serde_json::{Map, Value};
    use std::io::Read;

    pub const XML_TYPES: [&str; 3] = ["application/xml", "text/xml", "application/atom+xml"];

    pub struct XmlParser {
        content_type: String,
    }

    impl XmlParser {
        pub fn new(content_type: &str) -> Self {
            Self {
                content_type: content_type.to_string(),
            }
        }
    }

    impl BodyParser for XmlParser {
        fn content_type(&self) -> &str {
            &self.content_type
        }

        fn parse(&self, body: &mut dyn Read) -> anyhow::Result<Value> {
            let mut text = String::new();
            body.read_to_string(&mut text)?;
            let mut map = Map::new();
            let mut rest = text.trim();
            while let Some(open) = rest.strip_prefix('<') {
                let end = open
                    .find('>')
                    .ok_or_else(|| anyhow::anyhow!("unterminated tag"))?;
                let tag = &open[..end];
                let closing = format!("</{tag}>");
                let after = &open[end + 1..];
                let close = after
                    .find(&closing)
                    .ok_or_else(|| anyhow::anyhow!("missing {closing}"))?;
                map.insert(tag.to_string(), Value::String(after[..close].to_string()));
                rest = after[close + closing.len()..].trim();
            }
            if !rest.is_empty() {
                anyhow::bail!("unexpected text {rest:?}");
            }
            Ok(Value::Object(map))
        }
    }

    pub struct XmlSerializer {
        content_type: String,
    }

    impl XmlSerializer {
        pub fn new(content_type: &str) -> Self {
            Self {
                content_type: content_type.to_string(),
            }
        }
    }

    impl ContentSerializer for XmlSerializer {
        fn content_type(&self) -> &str {
            &self.content_type
        }

        fn serialize(&self, renderable: &mut dyn Renderable) -> anyhow::Result<()> {
            let Some(Value::Object(map)) = renderable.object() else {
                anyhow::bail!("xml serializer needs an object");
            };
            let mut out = String::new();
            for (k, v) in map {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(&format!("<{k}>{text}</{k}>"));
            }
            renderable.set_serialized(out.into_bytes(), &self.content_type);
            Ok(())
        }
    }

    /// Serializer that always fails.
    pub struct BrokenSerializer(pub &'static str);

    impl ContentSerializer for BrokenSerializer {
        fn content_type(&self) -> &str {
            self.0
        }

        fn serialize(&self, _renderable: &mut dyn Renderable) -> anyhow::Result<()> {
            anyhow::bail!("serializer exploded")
        }
    }
}

pub mod wire {
    //! Building request heads and reading back raw responses.

    use brrtengine::context::RequestHead;
    use brrtengine::response::HeaderVec;
    use http::{Method, Version};
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    pub fn head(method: Method, uri: &str, headers: &[(&str, &str)]) -> RequestHead {
        let headers: HeaderVec = headers
            .iter()
            .map(|(k, v)| (Arc::<str>::from(*k), (*v).to_string()))
            .collect();
        RequestHead::new(method, uri, Version::HTTP_11, headers)
    }

    /// Writer whose contents stay readable after it has been moved into a
    /// connection.
    #[derive(Clone, Default)]
    pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn take(&self) -> Vec<u8> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer that fails its first `failures` writes.
    pub struct FlakyWriter {
        pub failures: usize,
        pub inner: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.inner.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    pub struct RawResponse {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl RawResponse {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn headers_named(&self, name: &str) -> Vec<&str> {
            self.headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .collect()
        }

        pub fn body_text(&self) -> String {
            String::from_utf8_lossy(&self.body).into_owned()
        }
    }

    /// Parse every response in `bytes`. Bodies without `Content-Length`
    /// extend to the end of the input.
    pub fn parse_responses(mut bytes: &[u8]) -> Vec<RawResponse> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut resp = httparse::Response::new(&mut headers);
            let consumed = match resp.parse(bytes).unwrap() {
                httparse::Status::Complete(n) => n,
                httparse::Status::Partial => panic!("incomplete response head"),
            };
            let headers: Vec<(String, String)> = resp
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            let status = resp.code.unwrap();
            let rest = &bytes[consumed..];
            let len = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .map(|(_, v)| v.parse::<usize>().unwrap())
                .unwrap_or(rest.len());
            out.push(RawResponse {
                status,
                headers,
                body: rest[..len].to_vec(),
            });
            bytes = &rest[len..];
        }
        out
    }

    pub fn parse_response(bytes: &[u8]) -> RawResponse {
        let mut all = parse_responses(bytes);
        assert_eq!(all.len(), 1, "expected exactly one response");
        all.remove(0)
    }
}

pub mod engine {
    use super::xml::{XmlParser, XmlSerializer, XML_TYPES};
    use brrtengine::content::ContentRegistry;
    use brrtengine::error_handler::ErrorHandlerChain;
    use brrtengine::router::RouteTable;
    use brrtengine::runtime_config::{EngineConfig, PoolConfig};
    use brrtengine::server::AppService;
    use std::sync::Arc;

    pub fn test_config() -> EngineConfig {
        EngineConfig {
            pool: PoolConfig {
                num_workers: 2,
                ..PoolConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    /// Registry with XML parsers and serializers for every XML media type.
    pub fn xml_registry() -> Arc<ContentRegistry> {
        let registry = Arc::new(ContentRegistry::new());
        for ct in XML_TYPES {
            registry.register_parser(Arc::new(XmlParser::new(ct)));
            registry.register_serializer(Arc::new(XmlSerializer::new(ct)));
        }
        registry
    }

    pub fn service(routes: RouteTable) -> AppService {
        service_with(routes, Arc::new(ErrorHandlerChain::new()), test_config())
    }

    pub fn service_with(
        routes: RouteTable,
        chain: Arc<ErrorHandlerChain>,
        config: EngineConfig,
    ) -> AppService {
        super::test_server::setup_may_runtime();
        AppService::builder()
            .routes(routes)
            .content(xml_registry())
            .error_handlers(chain)
            .config(config)
            .build()
    }
}
