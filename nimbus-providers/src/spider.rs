use crate::{CloudAdapter, CreatedVm, VmAccessInfo, VmControl, VmCreateSpec};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Per-call deadlines. Status polls are short; create can take many minutes.
#[derive(Debug, Clone, Copy)]
pub struct SpiderTimeouts {
    pub status: Duration,
    pub control: Duration,
    pub create: Duration,
}

impl Default for SpiderTimeouts {
    fn default() -> Self {
        Self {
            status: Duration::from_secs(60),
            control: Duration::from_secs(600),
            create: Duration::from_secs(1800),
        }
    }
}

/// HTTP client for the cloud-abstraction service.
pub struct SpiderClient {
    client: Client,
    base_url: String,
    timeouts: SpiderTimeouts,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Deserialize, Default)]
struct IId {
    #[serde(rename = "SystemId", default)]
    system_id: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "IId", default)]
    iid: IId,
    #[serde(flatten)]
    access: VmAccessInfo,
}

impl SpiderClient {
    pub fn new(base_url: &str, timeouts: SpiderTimeouts) -> Result<Self> {
        // No overall client timeout: every request sets its own.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            timeouts,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<(&str, &str)>,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .timeout(timeout)
            .json(&body);
        if let Some(q) = query {
            req = req.query(&[q]);
        }
        tracing::debug!("[spider] {} {}", method, url);

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "{} {} failed: status={} body={}",
                method,
                url,
                status.as_u16(),
                text.trim()
            ));
        }
        Ok(resp)
    }
}

#[async_trait]
impl CloudAdapter for SpiderClient {
    async fn create_vm(&self, spec: &VmCreateSpec) -> Result<CreatedVm> {
        let body = json!({
            "ConnectionName": spec.connection_name,
            "ReqInfo": {
                "Name": spec.name,
                "ImageName": spec.image_name,
                "VMSpecName": spec.spec_name,
                "VPCName": spec.vpc_name,
                "SubnetName": spec.subnet_name,
                "SecurityGroupNames": spec.security_group_names,
                "KeyPairName": spec.key_pair_name,
                "DataDiskNames": spec.data_disk_names,
            }
        });
        let resp = self
            .send(Method::POST, "/vm", None, body, self.timeouts.create)
            .await?;
        let created: CreateResponse = resp.json().await?;
        if created.iid.system_id.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "create vm {}: no SystemId in response",
                spec.name
            ));
        }
        Ok(CreatedVm {
            csp_id: created.iid.system_id,
            access: created.access,
        })
    }

    async fn vm_status(&self, connection_name: &str, csp_id: &str) -> Result<String> {
        let resp = self
            .send(
                Method::GET,
                &format!("/vmstatus/{}", csp_id),
                None,
                json!({ "ConnectionName": connection_name }),
                self.timeouts.status,
            )
            .await?;
        let status: StatusResponse = resp.json().await?;
        Ok(status.status)
    }

    async fn control_vm(
        &self,
        connection_name: &str,
        csp_id: &str,
        action: VmControl,
    ) -> Result<()> {
        self.send(
            Method::GET,
            &format!("/controlvm/{}", csp_id),
            Some(("action", action.as_query())),
            json!({ "ConnectionName": connection_name }),
            self.timeouts.control,
        )
        .await?;
        Ok(())
    }

    async fn terminate_vm(&self, connection_name: &str, csp_id: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/vm/{}", csp_id),
            None,
            json!({ "ConnectionName": connection_name }),
            self.timeouts.control,
        )
        .await?;
        Ok(())
    }

    async fn vm_access_info(&self, connection_name: &str, csp_id: &str) -> Result<VmAccessInfo> {
        let resp = self
            .send(
                Method::GET,
                &format!("/vm/{}", csp_id),
                None,
                json!({ "ConnectionName": connection_name }),
                self.timeouts.status,
            )
            .await?;
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fake_spider() -> Router {
        Router::new()
            .route(
                "/vmstatus/{id}",
                get(|Path(id): Path<String>| async move {
                    if id == "broken" {
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    Ok(Json(json!({ "Status": "Suspending" })))
                }),
            )
            .route(
                "/controlvm/{id}",
                get(
                    |Path(_id): Path<String>, Query(q): Query<HashMap<String, String>>| async move {
                        match q.get("action").map(|s| s.as_str()) {
                            Some("reboot") | Some("suspend") | Some("resume") => {
                                Ok(Json(json!({ "Status": "ok" })))
                            }
                            _ => Err(StatusCode::BAD_REQUEST),
                        }
                    },
                ),
            )
            .route(
                "/vm/{id}",
                get(|Path(_id): Path<String>| async move {
                    Json(json!({
                        "Status": "Running",
                        "PublicIP": "52.1.1.1",
                        "PrivateIP": "10.1.0.7",
                        "SSHAccessPoint": "52.1.1.1:22"
                    }))
                })
                .delete(|Path(_id): Path<String>| async move { Json(json!({ "Result": "true" })) }),
            )
    }

    #[tokio::test]
    async fn status_control_and_access_info() {
        let base = serve(fake_spider()).await;
        let client = SpiderClient::new(&base, SpiderTimeouts::default()).unwrap();

        let status = client.vm_status("aws-seoul", "i-123").await.unwrap();
        assert_eq!(status, "Suspending");

        client
            .control_vm("aws-seoul", "i-123", VmControl::Reboot)
            .await
            .unwrap();
        client.terminate_vm("aws-seoul", "i-123").await.unwrap();

        let info = client.vm_access_info("aws-seoul", "i-123").await.unwrap();
        assert_eq!(info.public_ip, "52.1.1.1");
        assert_eq!(info.ssh_port(), "22");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = serve(fake_spider()).await;
        let client = SpiderClient::new(&base, SpiderTimeouts::default()).unwrap();

        let err = client.vm_status("aws-seoul", "broken").await.unwrap_err();
        assert!(err.to_string().contains("status=500"));
    }
}
