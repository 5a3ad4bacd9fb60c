use std::net::SocketAddr;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, Service};
use kforward_commons::{Error, ResourceRef};
use kforward_core::traits::{ForwardRequest, PortForwarder};
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::net::{TcpListener, TcpStream};

/// Resolves a `ResourceRef` to a ready pod name and tunnels one connection attempt through
/// `kube::api::Portforwarder`, one attempt per call. Stream pooling and HTTP-log interception
/// live one level up, in `Worker` and `http_log`.
pub struct KubePortForwarder {
    clients: DashMap<String, Client>,
}

impl KubePortForwarder {
    pub fn new() -> Self {
        KubePortForwarder {
            clients: DashMap::new(),
        }
    }

    async fn client_for(&self, context: &str) -> Result<Client, Error> {
        if let Some(client) = self.clients.get(context) {
            return Ok(client.clone());
        }

        let kubeconfig = Kubeconfig::read()
            .map_err(|e| Error::Connect(format!("reading kubeconfig: {e}")))?;
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };
        let config = Config::from_kubeconfig(&kubeconfig, &options)
            .await
            .map_err(|e| Error::Connect(format!("building config for context {context}: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| Error::Connect(format!("building client for context {context}: {e}")))?;

        self.clients.insert(context.to_string(), client.clone());
        Ok(client)
    }

    async fn find_ready_pod(
        pod_api: &Api<Pod>,
        label_selector: &str,
    ) -> Result<String, Error> {
        let pods = pod_api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| Error::Resolve(format!("listing pods '{label_selector}': {e}")))?;

        pods.items
            .into_iter()
            .find(is_pod_ready)
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| {
                Error::Resolve(format!(
                    "no ready pods matching selector '{label_selector}'"
                ))
            })
    }
}

impl Default for KubePortForwarder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl PortForwarder for KubePortForwarder {
    async fn get_pod_for_resource(
        &self,
        context: &str,
        namespace: &str,
        resource: &ResourceRef,
    ) -> Result<String, Error> {
        let client = self.client_for(context).await?;
        let pod_api: Api<Pod> = Api::namespaced(client.clone(), namespace);

        match resource {
            ResourceRef::Pod { name } => {
                pod_api
                    .get(name)
                    .await
                    .map_err(|e| Error::Resolve(format!("pod '{name}' not found: {e}")))?;
                Ok(name.clone())
            }
            ResourceRef::PodSelector { selector } => {
                Self::find_ready_pod(&pod_api, selector).await
            }
            ResourceRef::Service { name } => {
                let svc_api: Api<Service> = Api::namespaced(client, namespace);
                match svc_api.get(name).await {
                    Ok(service) => {
                        let selector = service
                            .spec
                            .and_then(|spec| spec.selector)
                            .ok_or_else(|| {
                                Error::Resolve(format!("service '{name}' has no selector"))
                            })?;
                        let label_selector = selector
                            .iter()
                            .map(|(k, v)| format!("{k}={v}"))
                            .collect::<Vec<_>>()
                            .join(",");
                        Self::find_ready_pod(&pod_api, &label_selector).await
                    }
                    Err(kube::Error::Api(resp)) if resp.code == 404 => {
                        let label_selector = format!("app={name}");
                        Self::find_ready_pod(&pod_api, &label_selector).await
                    }
                    Err(e) => Err(Error::Resolve(format!("finding service '{name}': {e}"))),
                }
            }
        }
    }

    async fn forward(&self, req: ForwardRequest) -> Result<(), Error> {
        let client = self.client_for(&req.context).await?;
        let pod_name = self
            .get_pod_for_resource(&req.context, &req.namespace, &req.resource)
            .await?;
        let pod_api: Api<Pod> = Api::namespaced(client, &req.namespace);

        let addr: SocketAddr = ([127, 0, 0, 1], req.local_port).into();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Connect(format!("binding 127.0.0.1:{}: {e}", req.local_port)))?;

        let _ = req.ready.send(());

        loop {
            tokio::select! {
                _ = req.stop.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (client_stream, _) = accepted
                        .map_err(|e| Error::Connect(format!("accepting local connection: {e}")))?;
                    let pod_api = pod_api.clone();
                    let pod_name = pod_name.clone();
                    let remote_port = req.remote_port;
                    let child = req.stop.child_token();
                    tokio::spawn(async move {
                        if let Err(err) =
                            relay_one(&pod_api, &pod_name, remote_port, client_stream, child).await
                        {
                            log::warn!("forward connection to {pod_name}:{remote_port} ended: {err}");
                        }
                    });
                }
            }
        }
    }
}

async fn relay_one(
    pod_api: &Api<Pod>,
    pod_name: &str,
    remote_port: u16,
    mut client_stream: TcpStream,
    stop: tokio_util::sync::CancellationToken,
) -> Result<(), Error> {
    let mut port_forwarder = pod_api
        .portforward(pod_name, &[remote_port])
        .await
        .map_err(|e| Error::Connect(format!("portforward to {pod_name}:{remote_port}: {e}")))?;
    let mut upstream = port_forwarder
        .take_stream(remote_port)
        .ok_or_else(|| Error::Connect(format!("no stream for port {remote_port}")))?;

    tokio::select! {
        _ = stop.cancelled() => Ok(()),
        result = tokio::io::copy_bidirectional(&mut client_stream, &mut upstream) => {
            result
                .map(|_| ())
                .map_err(|e| Error::Connect(format!("relay to {pod_name}:{remote_port}: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_pod_ready_requires_ready_condition_true() {
        use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_pod_ready(&pod));

        pod.status.as_mut().unwrap().conditions.as_mut().unwrap()[0].status = "False".to_string();
        assert!(!is_pod_ready(&pod));
    }

    #[test]
    fn is_pod_ready_false_with_no_status() {
        assert!(!is_pod_ready(&Pod::default()));
    }
}
