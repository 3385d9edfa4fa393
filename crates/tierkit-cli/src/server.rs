use std::path::PathBuf;
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use tierkit_core::{ComputedEntitlements, EntitlementEngine, FeatureValue, GateError, Requirement};
use tierkit_store::{Store, load_catalog};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct TierkitServer {
    state: Arc<Mutex<ServerState>>,
    tool_router: ToolRouter<Self>,
}

struct ServerState {
    store: Store,
    engine: EntitlementEngine,
    /// Where `tierkit_reload_catalog` reads from. `None` disables reloads.
    catalog_path: Option<PathBuf>,
}

impl TierkitServer {
    pub fn new(store: Store, engine: EntitlementEngine, catalog_path: Option<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                store,
                engine,
                catalog_path,
            })),
            tool_router: Self::tool_router(),
        }
    }

    async fn entitlements(&self, account_id: &str) -> Result<Option<ComputedEntitlements>, McpError> {
        let state = self.state.lock().await;
        crate::compute_for_account(&state.store, &state.engine, account_id)
            .map_err(|e| McpError::internal_error(format!("{e:#}"), None))
    }

    async fn run_check(
        &self,
        account_id: &str,
        requirement: Requirement,
    ) -> Result<CallToolResult, McpError> {
        let entitlements = self.entitlements(account_id).await?;
        let outcome = requirement.check(entitlements.as_ref());
        Ok(json_result(&check_json(account_id, &outcome)))
    }
}

fn json_result(value: &serde_json::Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )])
}

fn check_json(account_id: &str, outcome: &Result<(), GateError>) -> serde_json::Value {
    match outcome {
        Ok(()) => serde_json::json!({
            "account_id": account_id,
            "allowed": true,
        }),
        Err(err) => serde_json::json!({
            "account_id": account_id,
            "allowed": false,
            "error": err.kind(),
            "message": err.to_string(),
        }),
    }
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct AccountRequest {
    /// Account whose subscription should be resolved
    account_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PermissionRequest {
    account_id: String,
    /// Permission the caller needs, e.g. "agent_run"
    permission: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FeatureRequest {
    account_id: String,
    /// Feature key to check
    feature: String,
    /// Required value (bool, number or string). Defaults to true.
    expected: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct LimitRequest {
    account_id: String,
    /// Limit key to check
    limit: String,
    /// Units already consumed in the current period
    usage: u64,
}

#[tool_router]
impl TierkitServer {
    #[tool(
        description = "Compute the effective entitlements (features, limits, permissions) for an account's subscription. Limits of -1 mean unlimited."
    )]
    async fn tierkit_compute(
        &self,
        Parameters(req): Parameters<AccountRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.entitlements(&req.account_id).await? {
            Some(ent) => {
                let value = serde_json::to_value(&ent)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(json_result(&value))
            }
            None => Ok(json_result(&check_json(
                &req.account_id,
                &Err(GateError::Unauthenticated),
            ))),
        }
    }

    #[tool(description = "Check whether an account holds a permission.")]
    async fn tierkit_check_permission(
        &self,
        Parameters(req): Parameters<PermissionRequest>,
    ) -> Result<CallToolResult, McpError> {
        self.run_check(&req.account_id, Requirement::permission(&req.permission))
            .await
    }

    #[tool(
        description = "Check whether an account's feature has the expected value (default: enabled)."
    )]
    async fn tierkit_check_feature(
        &self,
        Parameters(req): Parameters<FeatureRequest>,
    ) -> Result<CallToolResult, McpError> {
        let expected = match req.expected {
            Some(raw) => serde_json::from_value::<FeatureValue>(raw).map_err(|e| {
                McpError::invalid_params(format!("invalid expected value: {e}"), None)
            })?,
            None => FeatureValue::Bool(true),
        };
        let requirement = Requirement::Feature {
            key: req.feature,
            expected,
        };
        self.run_check(&req.account_id, requirement).await
    }

    #[tool(
        description = "Check whether current usage is still below an account's limit. Reports the limit and remaining headroom."
    )]
    async fn tierkit_check_limit(
        &self,
        Parameters(req): Parameters<LimitRequest>,
    ) -> Result<CallToolResult, McpError> {
        let entitlements = self.entitlements(&req.account_id).await?;
        let outcome = Requirement::limit(&req.limit, req.usage).check(entitlements.as_ref());

        let mut json = check_json(&req.account_id, &outcome);
        if let Some(ent) = &entitlements {
            json["limit"] = serde_json::json!(ent.check_limit(&req.limit));
            json["usage"] = serde_json::json!(req.usage);
            json["remaining"] = serde_json::json!(ent.remaining(&req.limit, req.usage));
        }
        Ok(json_result(&json))
    }

    #[tool(description = "Show the active tier and add-on catalog.")]
    async fn tierkit_catalog(&self) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        let catalog = state.engine.catalog().snapshot();
        let value = serde_json::to_value(catalog.as_ref())
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(json_result(&value))
    }

    #[tool(
        description = "Re-read the catalog file and swap it in atomically. On failure the current catalog stays active."
    )]
    async fn tierkit_reload_catalog(&self) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        let Some(path) = &state.catalog_path else {
            return Err(McpError::invalid_request(
                "no catalog file configured for this server",
                None,
            ));
        };

        let catalog = load_catalog(path).map_err(|e| {
            tracing::warn!("catalog reload failed: {e}");
            McpError::internal_error(format!("catalog reload failed: {e}"), None)
        })?;
        let tiers = catalog.tiers().len();
        let addons = catalog.addons().len();
        state.engine.catalog().replace(catalog);
        tracing::info!("catalog reloaded from {}", path.display());

        Ok(json_result(&serde_json::json!({
            "reloaded": true,
            "path": path.display().to_string(),
            "tiers": tiers,
            "addons": addons,
        })))
    }
}

#[tool_handler]
impl ServerHandler for TierkitServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Subscription entitlement checks for accounts.\n\n\
                 - Call tierkit_compute to see everything an account may use.\n\
                 - Before running a gated action, call tierkit_check_permission, \
                   tierkit_check_feature or tierkit_check_limit. \"allowed\": false carries \
                   the error kind (unauthenticated, forbidden, quota_exceeded) and a message.\n\
                 - A limit of -1 is unlimited.\n\
                 - After editing the catalog file, call tierkit_reload_catalog."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierkit_core::{SharedCatalog, Subscription};
    use tierkit_store::parse_catalog;

    const CATALOG: &str = r#"
[tiers.free]
name = "Free"
permissions = ["read"]
features = { api_access = false }
limits = { calls = 100 }

[tiers.pro]
name = "Pro"
inherits_from = "free"
features = { api_access = true }
limits = { calls = 1000, seats = -1 }

[addons.agent_pack]
name = "Agent Pack"
permissions = ["agent_run"]
limits = { calls = 500 }
"#;

    fn make_server_with(catalog_path: Option<PathBuf>) -> TierkitServer {
        let store = Store::open_in_memory().unwrap();
        store
            .create_subscription(&Subscription::new("acme", "pro").with_addon("agent_pack"))
            .unwrap();
        store
            .create_subscription(&Subscription::new("solo", "free"))
            .unwrap();
        let engine = EntitlementEngine::new(SharedCatalog::new(parse_catalog(CATALOG).unwrap()));
        TierkitServer::new(store, engine, catalog_path)
    }

    fn make_server() -> TierkitServer {
        make_server_with(None)
    }

    fn text_from_result(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn parse_result(result: &CallToolResult) -> serde_json::Value {
        let text = text_from_result(result);
        serde_json::from_str(&text).expect("handler should return valid JSON")
    }

    fn account(id: &str) -> Parameters<AccountRequest> {
        Parameters(AccountRequest {
            account_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_compute_merges_tier_and_addon() {
        let server = make_server();
        let json = parse_result(&server.tierkit_compute(account("acme")).await.unwrap());

        assert_eq!(json["tier"], "pro");
        assert_eq!(json["limits"]["calls"], 1500);
        assert_eq!(json["limits"]["seats"], -1);
        assert_eq!(json["features"]["api_access"], true);
        let perms: Vec<&str> = json["permissions"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap())
            .collect();
        assert_eq!(perms, vec!["agent_run", "read"]);
    }

    #[tokio::test]
    async fn test_compute_unknown_account() {
        let server = make_server();
        let json = parse_result(&server.tierkit_compute(account("nobody")).await.unwrap());
        assert_eq!(json["allowed"], false);
        assert_eq!(json["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_check_permission() {
        let server = make_server();

        let ok = server
            .tierkit_check_permission(Parameters(PermissionRequest {
                account_id: "acme".into(),
                permission: "agent_run".into(),
            }))
            .await
            .unwrap();
        assert_eq!(parse_result(&ok)["allowed"], true);

        let denied = server
            .tierkit_check_permission(Parameters(PermissionRequest {
                account_id: "solo".into(),
                permission: "agent_run".into(),
            }))
            .await
            .unwrap();
        let json = parse_result(&denied);
        assert_eq!(json["allowed"], false);
        assert_eq!(json["error"], "forbidden");
    }

    #[tokio::test]
    async fn test_check_feature_default_and_explicit() {
        let server = make_server();

        let enabled = server
            .tierkit_check_feature(Parameters(FeatureRequest {
                account_id: "acme".into(),
                feature: "api_access".into(),
                expected: None,
            }))
            .await
            .unwrap();
        assert_eq!(parse_result(&enabled)["allowed"], true);

        let disabled = server
            .tierkit_check_feature(Parameters(FeatureRequest {
                account_id: "solo".into(),
                feature: "api_access".into(),
                expected: None,
            }))
            .await
            .unwrap();
        assert_eq!(parse_result(&disabled)["error"], "forbidden");

        let explicit_false = server
            .tierkit_check_feature(Parameters(FeatureRequest {
                account_id: "solo".into(),
                feature: "api_access".into(),
                expected: Some(serde_json::json!(false)),
            }))
            .await
            .unwrap();
        assert_eq!(parse_result(&explicit_false)["allowed"], true);
    }

    #[tokio::test]
    async fn test_check_limit_reports_headroom() {
        let server = make_server();

        let ok = server
            .tierkit_check_limit(Parameters(LimitRequest {
                account_id: "acme".into(),
                limit: "calls".into(),
                usage: 1200,
            }))
            .await
            .unwrap();
        let json = parse_result(&ok);
        assert_eq!(json["allowed"], true);
        assert_eq!(json["limit"], 1500);
        assert_eq!(json["remaining"], 300);

        let over = server
            .tierkit_check_limit(Parameters(LimitRequest {
                account_id: "solo".into(),
                limit: "calls".into(),
                usage: 100,
            }))
            .await
            .unwrap();
        let json = parse_result(&over);
        assert_eq!(json["allowed"], false);
        assert_eq!(json["error"], "quota_exceeded");
        assert_eq!(json["remaining"], 0);
    }

    #[tokio::test]
    async fn test_check_limit_unlimited() {
        let server = make_server();
        let result = server
            .tierkit_check_limit(Parameters(LimitRequest {
                account_id: "acme".into(),
                limit: "seats".into(),
                usage: u64::MAX,
            }))
            .await
            .unwrap();
        let json = parse_result(&result);
        assert_eq!(json["allowed"], true);
        assert!(json["remaining"].is_null());
    }

    #[tokio::test]
    async fn test_catalog_lists_tiers() {
        let server = make_server();
        let json = parse_result(&server.tierkit_catalog().await.unwrap());
        assert_eq!(json["tiers"]["pro"]["inherits_from"], "free");
        assert_eq!(json["addons"]["agent_pack"]["name"], "Agent Pack");
    }

    #[tokio::test]
    async fn test_reload_without_path_is_rejected() {
        let server = make_server();
        assert!(server.tierkit_reload_catalog().await.is_err());
    }

    #[tokio::test]
    async fn test_reload_swaps_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, CATALOG).unwrap();
        let server = make_server_with(Some(path.clone()));

        let upgraded = CATALOG.replace("limits = { calls = 100 }", "limits = { calls = 250 }");
        std::fs::write(&path, upgraded).unwrap();

        let json = parse_result(&server.tierkit_reload_catalog().await.unwrap());
        assert_eq!(json["reloaded"], true);
        assert_eq!(json["tiers"], 2);

        let solo = parse_result(&server.tierkit_compute(account("solo")).await.unwrap());
        assert_eq!(solo["limits"]["calls"], 250);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.toml");
        std::fs::write(&path, CATALOG).unwrap();
        let server = make_server_with(Some(path.clone()));

        std::fs::write(&path, "[tiers.a]\nname = \"A\"\ninherits_from = \"a\"\n").unwrap();
        assert!(server.tierkit_reload_catalog().await.is_err());

        let acme = parse_result(&server.tierkit_compute(account("acme")).await.unwrap());
        assert_eq!(acme["limits"]["calls"], 1500);
    }
}
