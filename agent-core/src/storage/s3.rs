use super::sigv4::{self, CanonicalRequest, Credentials};
use super::{ObjectInfo, ObjectStorage, StorageConnector};
use crate::constants::storage;
use crate::task::StorageTarget;
use crate::{AgentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use reqwest::{Body, Client, Method, StatusCode, Url};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::io::ReaderStream;

static CONTENTS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Contents>(.*?)</Contents>").expect("valid regex"));
static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Key>(.*?)</Key>").expect("valid regex"));
static LAST_MODIFIED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<LastModified>(.*?)</LastModified>").expect("valid regex"));
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Size>(\d+)</Size>").expect("valid regex"));
static TRUNCATED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>").expect("valid regex"));
static NEXT_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<NextContinuationToken>(.*?)</NextContinuationToken>").expect("valid regex")
});
static ERROR_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Code>(.*?)</Code>").expect("valid regex"));
static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|lt|gt|quot|apos|amp);").expect("valid regex")
});

/// 去掉 endpoint 的协议前缀，仅当原始值以 https:// 开头时启用 TLS
pub fn normalize_endpoint(endpoint: &str) -> (String, bool) {
    let secure = endpoint.starts_with("https://");
    let host = endpoint
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string();
    (host, secure)
}

/// 基于 S3 REST 接口（路径风格）的对象存储客户端
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    base_url: Url,
    host: String,
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
}

/// 单页列举结果
#[derive(Debug, Default)]
struct ListPage {
    objects: Vec<ObjectInfo>,
    next_token: Option<String>,
}

impl S3Storage {
    pub fn new(target: &StorageTarget, client: Client) -> Result<Self> {
        let (endpoint, secure) = normalize_endpoint(&target.endpoint);
        let scheme = if secure { "https" } else { "http" };
        let base_url = Url::parse(&format!("{scheme}://{endpoint}/"))
            .map_err(|e| AgentError::storage(format!("无效的对象存储地址 {endpoint}: {e}")))?;

        let host_name = base_url
            .host_str()
            .ok_or_else(|| AgentError::storage(format!("对象存储地址缺少主机名: {endpoint}")))?;
        let host = match base_url.port() {
            Some(port) => format!("{host_name}:{port}"),
            None => host_name.to_string(),
        };

        Ok(Self {
            client,
            base_url,
            host,
            bucket: target.bucket.clone(),
            region: target.region.clone(),
            access_key: target.access_key.clone(),
            secret_key: target.secret_key.clone(),
        })
    }

    fn signing_region(&self) -> &str {
        if self.region.is_empty() {
            storage::DEFAULT_REGION
        } else {
            &self.region
        }
    }

    fn object_path(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!(
                "/{}/{}",
                sigv4::uri_encode(&self.bucket, true),
                sigv4::uri_encode(key, false)
            ),
            None => format!("/{}/", sigv4::uri_encode(&self.bucket, true)),
        }
    }

    /// 构造已签名的请求
    fn signed_request(
        &self,
        method: Method,
        uri_path: &str,
        query: &str,
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let now = Utc::now();
        let auth = sigv4::authorization(
            &CanonicalRequest {
                method: method.as_str(),
                uri_path,
                query,
                host: &self.host,
                payload_hash,
            },
            &Credentials {
                access_key: &self.access_key,
                secret_key: &self.secret_key,
                region: self.signing_region(),
                service: storage::SIGNING_SERVICE,
            },
            now,
        );

        let mut url = self.base_url.clone();
        url.set_path(uri_path);
        url.set_query(if query.is_empty() { None } else { Some(query) });

        self.client
            .request(method, url)
            .header("Host", &self.host)
            .header("x-amz-date", now.format(sigv4::AMZ_DATE_FORMAT).to_string())
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", auth)
    }

    async fn list_page(&self, token: Option<&str>) -> Result<ListPage> {
        let page_size = storage::LIST_PAGE_SIZE.to_string();
        let mut params = vec![("list-type", "2"), ("max-keys", page_size.as_str())];
        if let Some(token) = token {
            params.push(("continuation-token", token));
        }
        let query = sigv4::canonical_query(&params);
        let path = self.object_path(None);
        let payload_hash = sigv4::hex_sha256(b"");

        let response = self
            .signed_request(Method::GET, &path, &query, &payload_hash)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(error_from_response("列举对象", status, &body));
        }

        parse_list_page(&body)
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn bucket_exists(&self) -> Result<bool> {
        let path = self.object_path(None);
        let payload_hash = sigv4::hex_sha256(b"");
        let response = self
            .signed_request(Method::HEAD, &path, "", &payload_hash)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(AgentError::storage(format!(
                "检查存储桶 {} 失败: HTTP {}",
                self.bucket, status
            ))),
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        let body = match self.signing_region() {
            storage::DEFAULT_REGION => String::new(),
            region => format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{region}</LocationConstraint></CreateBucketConfiguration>"
            ),
        };
        let path = self.object_path(None);
        let payload_hash = sigv4::hex_sha256(body.as_bytes());

        let response = self
            .signed_request(Method::PUT, &path, "", &payload_hash)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            tracing::info!(bucket = %self.bucket, "存储桶已创建");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        // 检查与创建之间其他进程已创建同名存储桶
        if status == StatusCode::CONFLICT || is_already_exists(&text) {
            tracing::info!(bucket = %self.bucket, "存储桶已存在，跳过创建");
            return Ok(());
        }
        Err(error_from_response("创建存储桶", status, &text))
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let object_path = self.object_path(Some(key));

        let response = self
            .signed_request(Method::PUT, &object_path, "", sigv4::UNSIGNED_PAYLOAD)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(error_from_response(&format!("上传对象 {key}"), status, &text))
    }

    async fn list_objects(&self) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(token.as_deref()).await?;
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let path = self.object_path(Some(key));
        let payload_hash = sigv4::hex_sha256(b"");
        let response = self
            .signed_request(Method::DELETE, &path, "", &payload_hash)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(error_from_response(&format!("删除对象 {key}"), status, &text))
    }
}

fn is_already_exists(body: &str) -> bool {
    matches!(
        ERROR_CODE_RE
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str()),
        Some("BucketAlreadyOwnedByYou") | Some("BucketAlreadyExists")
    )
}

fn error_from_response(operation: &str, status: StatusCode, body: &str) -> AgentError {
    let code = ERROR_CODE_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    match code {
        Some(code) => AgentError::storage(format!("{operation}失败: HTTP {status} ({code})")),
        None => AgentError::storage(format!("{operation}失败: HTTP {status}")),
    }
}

/// 单次扫描解码 XML 实体，包括 `&#N;` 与 `&#xN;` 字符引用；无效的字符引用原样保留
fn xml_unescape(value: &str) -> String {
    ENTITY_RE
        .replace_all(value, |caps: &Captures| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let number = &entity[1..];
                    let code = match number.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => number.parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// 解析 ListObjectsV2 响应
fn parse_list_page(body: &str) -> Result<ListPage> {
    let mut objects = Vec::new();
    for contents in CONTENTS_RE.captures_iter(body) {
        let block = &contents[1];
        let key = KEY_RE
            .captures(block)
            .map(|c| xml_unescape(&c[1]))
            .ok_or_else(|| AgentError::storage("列举结果缺少 Key 字段"))?;
        let last_modified = LAST_MODIFIED_RE
            .captures(block)
            .ok_or_else(|| AgentError::storage(format!("对象 {key} 缺少 LastModified 字段")))?;
        let last_modified = DateTime::parse_from_rfc3339(last_modified[1].trim())
            .map_err(|e| AgentError::storage(format!("对象 {key} 的修改时间无法解析: {e}")))?
            .with_timezone(&Utc);
        let size = SIZE_RE
            .captures(block)
            .and_then(|c| c[1].parse::<u64>().ok())
            .unwrap_or(0);

        objects.push(ObjectInfo {
            key,
            last_modified,
            size,
        });
    }

    let next_token = if TRUNCATED_RE.is_match(body) {
        let token = NEXT_TOKEN_RE
            .captures(body)
            .map(|c| xml_unescape(&c[1]))
            .ok_or_else(|| AgentError::storage("列举结果被截断但缺少续传标记"))?;
        Some(token)
    } else {
        None
    };

    Ok(ListPage {
        objects,
        next_token,
    })
}

/// 根据任务配置创建 S3 客户端
#[derive(Debug, Clone)]
pub struct S3Connector {
    client: Client,
}

impl S3Connector {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(storage::CONNECT_TIMEOUT))
            .build()?;
        Ok(Self { client })
    }
}

impl StorageConnector for S3Connector {
    fn connect(&self, target: &StorageTarget) -> Result<Arc<dyn ObjectStorage>> {
        Ok(Arc::new(S3Storage::new(target, self.client.clone())?))
    }
}
