//! RPC Facade (spec.md §4.10) — boundary only.
//!
//! This module holds the *framework-agnostic* half of the facade: request
//! validation, batch-size enforcement, and wiring calls through to the
//! stores and the `EngineManager`. `src/bin/first_server.rs` is the thin
//! `axum` layer that turns HTTP requests into calls on [`Facade`] and
//! results back into the wire envelope (spec.md §6) — HTTP routing itself
//! stays out of scope (spec.md §1) the way the component table marks this
//! whole module "boundary only".

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::disasm;
use crate::engine_manager::{EngineManager, ScanAnnotation};
use crate::engines::FunctionDump;
use crate::error::{FirstError, Result};
use crate::id_codec;
use crate::metrics::{Metrics, Operation};
use crate::models::{SampleKey, SampleKeyOwned, User};
use crate::store::metadata_store::{AnnotationDump, HistoryDump};
use crate::store::{FunctionLookup, FunctionStore, MetadataStore, UserStore};

const NAME_MAX: usize = 256;
const PROTOTYPE_MAX: usize = 256;
const COMMENT_MAX: usize = 512;
const API_MAX: usize = 128;
const ARCHITECTURE_MAX: usize = 64;

fn api_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_:@?$.]+$").unwrap())
}

fn validate_api(api: &str) -> Result<()> {
    if api.len() > API_MAX {
        return Err(FirstError::InputInvalid(format!(
            "API {api} is longer than {API_MAX} bytes"
        )));
    }
    if !api_regex().is_match(api) {
        return Err(FirstError::InputInvalid(format!(
            "invalid characters in API {api:?}; expected {}",
            api_regex().as_str()
        )));
    }
    Ok(())
}

fn validate_apis(apis: &[String]) -> Result<HashSet<String>> {
    for api in apis {
        validate_api(api)?;
    }
    Ok(apis.iter().cloned().collect())
}

fn decode_opcodes(encoded: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| FirstError::InputInvalid("Unable to decode opcodes".to_string()))
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(FirstError::InputInvalid(format!(
            "{field} exceeds the maximum length ({max})"
        )));
    }
    Ok(())
}

/// One function submitted to `metadata_add`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmittedFunction {
    pub opcodes: String,
    pub architecture: String,
    pub name: String,
    pub prototype: String,
    pub comment: String,
    pub apis: Vec<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataAddRequest {
    pub md5: String,
    pub crc32: u32,
    pub functions: HashMap<String, SubmittedFunction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataAddResponse {
    pub results: HashMap<String, String>,
}

/// One function submitted to `metadata_scan`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannedFunction {
    pub opcodes: String,
    pub architecture: String,
    pub apis: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataScanRequest {
    pub functions: HashMap<String, ScannedFunction>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ScanResults {
    pub engines: HashMap<String, String>,
    pub matches: HashMap<String, Vec<ScanAnnotation>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedPage {
    pub page: usize,
    pub pages: usize,
    pub results: Vec<AnnotationDump>,
}

/// The framework-agnostic half of the RPC Facade. Owns references to every
/// store and the `EngineManager`; a request handler authenticates an API
/// key into a [`User`] first, then calls one method per spec.md §4.10
/// operation.
pub struct Facade {
    pub users: Arc<UserStore>,
    pub functions: Arc<FunctionStore>,
    pub metadata: Arc<MetadataStore>,
    pub engines: Arc<EngineManager>,
    pub metrics: Arc<Metrics>,
    pub config: ServerConfig,
}

impl Facade {
    pub fn new(
        users: Arc<UserStore>,
        functions: Arc<FunctionStore>,
        metadata: Arc<MetadataStore>,
        engines: Arc<EngineManager>,
        metrics: Arc<Metrics>,
        config: ServerConfig,
    ) -> Self {
        Self {
            users,
            functions,
            metadata,
            engines,
            metrics,
            config,
        }
    }

    /// Resolve the API key carried in the request path to its owning user.
    /// `Unauthorized` maps to HTTP 401 with no body at the HTTP layer
    /// (spec.md §6).
    pub fn authenticate(&self, api_key: Uuid) -> Result<User> {
        self.users.resolve_api_key(api_key).ok_or(FirstError::Unauthorized)
    }

    pub fn test_connection(&self) -> serde_json::Value {
        serde_json::json!({ "status": "connected" })
    }

    /// Union of every architecture tag seen in storage with the hard-coded
    /// standards set (spec.md §4.10).
    pub fn architectures(&self) -> Vec<String> {
        let mut set: HashSet<String> = self.functions.architectures();
        set.extend(disasm::STANDARD_ARCHITECTURES.iter().map(|s| s.to_string()));
        let mut out: Vec<String> = set.into_iter().collect();
        out.sort();
        out
    }

    pub fn checkin(
        &self,
        user: &User,
        md5: &str,
        crc32: u32,
        sha1: Option<&str>,
        sha256: Option<&str>,
    ) -> bool {
        self.metrics.time(Operation::Checkin, || {
            self.functions.checkin(user.id, md5, crc32, sha1, sha256)
        })
    }

    pub fn metadata_add(
        &self,
        user: &User,
        req: MetadataAddRequest,
    ) -> Result<MetadataAddResponse> {
        self.metrics.time(Operation::MetadataAdd, || self.metadata_add_inner(user, req))
    }

    fn metadata_add_inner(&self, user: &User, req: MetadataAddRequest) -> Result<MetadataAddResponse> {
        if req.functions.len() > self.config.max_functions_per_batch {
            return Err(FirstError::InputInvalid(format!(
                "at most {} functions per batch",
                self.config.max_functions_per_batch
            )));
        }
        if !is_lower_hex(&req.md5, 32) {
            return Err(FirstError::InputInvalid("MD5 is not valid".to_string()));
        }

        for f in req.functions.values() {
            check_len("architecture", &f.architecture, ARCHITECTURE_MAX)?;
            check_len("name", &f.name, NAME_MAX)?;
            check_len("prototype", &f.prototype, PROTOTYPE_MAX)?;
            check_len("comment", &f.comment, COMMENT_MAX)?;
            validate_apis(&f.apis)?;
        }

        let sample = self
            .functions
            .get_sample(&req.md5, req.crc32, true)
            .ok_or_else(|| FirstError::InputInvalid("Sample does not exist in FIRST".to_string()))?;
        let sample_key = SampleKey {
            md5: sample.md5.clone(),
            crc32: sample.crc32,
        };
        let sample_key_owned = SampleKeyOwned {
            md5: sample.md5.clone(),
            crc32: sample.crc32,
        };

        let mut results = HashMap::new();
        for (client_id, f) in req.functions {
            // An `id` naming an engine-synthesized result can never be
            // re-annotated through this path — skip it silently, matching
            // the original's fallthrough for that branch.
            if let Some(id) = &f.id {
                if id_codec::is_engine(id) {
                    continue;
                }
            }

            let opcodes = decode_opcodes(&f.opcodes)?;
            let apis = validate_apis(&f.apis)?;

            let function = self
                .functions
                .get_function(&opcodes, &f.architecture, &apis, true)
                .ok_or_else(|| FirstError::InputInvalid("Function does not exist in FIRST".to_string()))?;
            self.functions.add_function_to_sample(&sample_key, function.id);

            let metadata_id =
                self.metadata
                    .add_metadata_to_function(user.id, function.id, &f.name, &f.prototype, &f.comment);
            self.functions.link_metadata(function.id, metadata_id);

            let encoded_id = id_codec::encode_user(metadata_id);
            self.metadata.applied(&sample_key_owned, user.id, &encoded_id);

            let disassembly = disasm::disassemble(&opcodes, &f.architecture);
            self.metrics.time(Operation::EngineAdd, || {
                self.engines.add(&FunctionDump {
                    id: function.id,
                    apis: &apis,
                    opcodes: &opcodes,
                    architecture: &f.architecture,
                    sha256: &function.sha256,
                    disassembly: disassembly.as_ref(),
                });
            });

            results.insert(client_id, encoded_id);
        }

        Ok(MetadataAddResponse { results })
    }

    fn check_ids_batch(&self, ids: &[String]) -> Result<()> {
        if ids.len() > self.config.max_ids_per_batch {
            return Err(FirstError::InputInvalid(format!(
                "at most {} ids per batch",
                self.config.max_ids_per_batch
            )));
        }
        for id in ids {
            if id.len() != 26 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(FirstError::InputInvalid(format!("invalid id value: {id:?}")));
            }
        }
        Ok(())
    }

    pub fn metadata_get(&self, ids: &[String]) -> Result<Vec<AnnotationDump>> {
        self.metrics.time(Operation::MetadataGet, || {
            self.check_ids_batch(ids)?;
            Ok(self.metadata.get_metadata_list(ids, &self.users, self.engines.as_ref()))
        })
    }

    pub fn metadata_history(&self, ids: &[String]) -> Result<HashMap<String, HistoryDump>> {
        self.check_ids_batch(ids)?;
        Ok(self.metadata.metadata_history(ids, &self.users, self.engines.as_ref()))
    }

    pub fn metadata_delete(&self, user: &User, id: &str) -> bool {
        self.metadata.delete_metadata(user.id, id)
    }

    pub fn metadata_created(&self, user: &User, page: usize) -> CreatedPage {
        self.metrics.time(Operation::MetadataCreated, || {
            let (results, pages) = self.metadata.created(user.id, page, self.config.page_size, &self.users);
            CreatedPage { page, pages, results }
        })
    }

    pub fn metadata_applied(&self, user: &User, md5: &str, crc32: u32, id: &str) -> Result<bool> {
        let sample = self
            .functions
            .get_sample(md5, crc32, false)
            .ok_or_else(|| FirstError::NotFound("Sample does not exist in FIRST".to_string()))?;
        let key = SampleKeyOwned {
            md5: sample.md5,
            crc32: sample.crc32,
        };
        Ok(self.metadata.applied(&key, user.id, id))
    }

    pub fn metadata_unapplied(&self, user: &User, md5: &str, crc32: u32, id: &str) -> Result<bool> {
        let sample = self
            .functions
            .get_sample(md5, crc32, false)
            .ok_or_else(|| FirstError::NotFound("Sample does not exist in FIRST".to_string()))?;
        let key = SampleKeyOwned {
            md5: sample.md5,
            crc32: sample.crc32,
        };
        Ok(self.metadata.unapplied(&key, user.id, id))
    }

    pub fn metadata_scan(&self, req: MetadataScanRequest) -> Result<ScanResults> {
        self.metrics.time(Operation::MetadataScan, || self.metadata_scan_inner(req))
    }

    fn metadata_scan_inner(&self, req: MetadataScanRequest) -> Result<ScanResults> {
        if req.functions.len() > self.config.max_functions_per_batch {
            return Err(FirstError::InputInvalid(format!(
                "at most {} functions per batch",
                self.config.max_functions_per_batch
            )));
        }

        let mut out = ScanResults::default();
        for (client_id, f) in req.functions {
            check_len("architecture", &f.architecture, ARCHITECTURE_MAX)?;
            let apis = validate_apis(&f.apis)?;
            let opcodes = decode_opcodes(&f.opcodes)?;

            let (engines, annotations) = self.metrics.time(Operation::EngineScan, || {
                self.engines.scan(&opcodes, &f.architecture, &apis)
            });
            if engines.is_empty() && annotations.is_empty() {
                continue;
            }
            out.engines.extend(engines);
            out.matches.insert(client_id, annotations);
        }
        Ok(out)
    }
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine_manager::EngineManager;
    use base64::Engine as _;

    fn facade() -> (Facade, User) {
        let users = Arc::new(UserStore::new());
        let functions = Arc::new(FunctionStore::new());
        let metadata = Arc::new(MetadataStore::new());
        let engines = Arc::new(EngineManager::with_default_catalog(
            functions.clone(),
            metadata.clone(),
            users.clone(),
        ));
        let metrics = Arc::new(Metrics::new());
        let config = ServerConfig::default();
        let user = users.register("u1_h4x0r", 1337);
        (
            Facade::new(users, functions, metadata, engines, metrics, config),
            user,
        )
    }

    fn b64(data: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    #[test]
    fn authenticate_rejects_unknown_key() {
        let (facade, _user) = facade();
        assert!(facade.authenticate(Uuid::new_v4()).is_err());
    }

    #[test]
    fn metadata_add_round_trip_then_scan_self_matches() {
        let (facade, user) = facade();
        let md5 = "a".repeat(32);

        let mut functions = HashMap::new();
        functions.insert(
            "0".to_string(),
            SubmittedFunction {
                opcodes: b64(b"The quick brown fox jumps over 13 lazy dogs."),
                architecture: "intel32".to_string(),
                name: "my_function_0".to_string(),
                prototype: "int my_function_0(int a)".to_string(),
                comment: "first annotation".to_string(),
                apis: vec!["CreateFileA".to_string()],
                id: None,
            },
        );

        let response = facade
            .metadata_add(
                &user,
                MetadataAddRequest {
                    md5: md5.clone(),
                    crc32: 0,
                    functions,
                },
            )
            .unwrap();
        assert_eq!(response.results.len(), 1);
        let id = &response.results["0"];
        assert!(id_codec::is_user(id));

        let dumps = facade.metadata_get(&[id.clone()]).unwrap();
        assert_eq!(dumps.len(), 1);
        assert_eq!(dumps[0].creator, "u1_h4x0r#1337");
        assert_eq!(dumps[0].name, "my_function_0");

        let mut scan_functions = HashMap::new();
        scan_functions.insert(
            "0".to_string(),
            ScannedFunction {
                opcodes: b64(b"The quick brown fox jumps over 13 lazy dogs."),
                architecture: "intel32".to_string(),
                apis: vec!["CreateFileA".to_string()],
            },
        );
        let scan = facade.metadata_scan(MetadataScanRequest { functions: scan_functions }).unwrap();
        let matches = &scan.matches["0"];
        assert!(!matches.is_empty());
        assert_eq!(matches[0].similarity, 100.0);
    }

    #[test]
    fn metadata_add_rejects_batch_over_limit() {
        let (facade, user) = facade();
        let mut functions = HashMap::new();
        for i in 0..21 {
            functions.insert(
                i.to_string(),
                SubmittedFunction {
                    opcodes: b64(b"x"),
                    architecture: "intel32".to_string(),
                    name: "f".to_string(),
                    prototype: "void f()".to_string(),
                    comment: "".to_string(),
                    apis: vec![],
                    id: None,
                },
            );
        }
        let result = facade.metadata_add(
            &user,
            MetadataAddRequest {
                md5: "a".repeat(32),
                crc32: 0,
                functions,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn metadata_add_rejects_invalid_api_characters() {
        let (facade, user) = facade();
        let mut functions = HashMap::new();
        functions.insert(
            "0".to_string(),
            SubmittedFunction {
                opcodes: b64(b"abc"),
                architecture: "intel32".to_string(),
                name: "f".to_string(),
                prototype: "void f()".to_string(),
                comment: "".to_string(),
                apis: vec!["bad api!".to_string()],
                id: None,
            },
        );
        let result = facade.metadata_add(
            &user,
            MetadataAddRequest {
                md5: "a".repeat(32),
                crc32: 0,
                functions,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn metadata_add_rejects_bad_base64() {
        let (facade, user) = facade();
        let mut functions = HashMap::new();
        functions.insert(
            "0".to_string(),
            SubmittedFunction {
                opcodes: "not valid base64!!".to_string(),
                architecture: "intel32".to_string(),
                name: "f".to_string(),
                prototype: "void f()".to_string(),
                comment: "".to_string(),
                apis: vec![],
                id: None,
            },
        );
        let err = facade
            .metadata_add(
                &user,
                MetadataAddRequest {
                    md5: "a".repeat(32),
                    crc32: 0,
                    functions,
                },
            )
            .unwrap_err();
        assert!(matches!(err, FirstError::InputInvalid(_)));
    }

    #[test]
    fn applied_twice_is_idempotent_through_the_facade() {
        let (facade, user) = facade();
        let md5 = "a".repeat(32);
        let mut functions = HashMap::new();
        functions.insert(
            "0".to_string(),
            SubmittedFunction {
                opcodes: b64(b"applied twice opcodes"),
                architecture: "intel32".to_string(),
                name: "f".to_string(),
                prototype: "void f()".to_string(),
                comment: "".to_string(),
                apis: vec![],
                id: None,
            },
        );
        let response = facade
            .metadata_add(
                &user,
                MetadataAddRequest {
                    md5: md5.clone(),
                    crc32: 0,
                    functions,
                },
            )
            .unwrap();
        let id = response.results["0"].clone();

        assert!(facade.metadata_applied(&user, &md5, 0, &id).unwrap());
        assert!(facade.metadata_applied(&user, &md5, 0, &id).unwrap());

        let dump = facade.metadata_get(&[id]).unwrap();
        assert_eq!(dump[0].rank, 1);
    }

    #[test]
    fn delete_by_non_owner_is_a_no_op() {
        let (facade, user) = facade();
        let other = facade.users.register("other", 1);
        let mut functions = HashMap::new();
        functions.insert(
            "0".to_string(),
            SubmittedFunction {
                opcodes: b64(b"owned by user one"),
                architecture: "intel32".to_string(),
                name: "f".to_string(),
                prototype: "void f()".to_string(),
                comment: "".to_string(),
                apis: vec![],
                id: None,
            },
        );
        let response = facade
            .metadata_add(
                &user,
                MetadataAddRequest {
                    md5: "a".repeat(32),
                    crc32: 0,
                    functions,
                },
            )
            .unwrap();
        let id = &response.results["0"];
        assert!(!facade.metadata_delete(&other, id));
        assert!(facade.metadata_delete(&user, id));
    }
}
