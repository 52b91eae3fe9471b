use crate::config::CredentialSource;
use crate::{MossError, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::path::Path;
use tracing::{debug, info};

pub struct K8sClient {
    client: Client,
}

/// Where credentials actually come from once `Auto` is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Credentials {
    InCluster,
    Kubeconfig,
}

impl K8sClient {
    /// Connect with credentials from `source`. `kubeconfig` overrides the
    /// default kubeconfig lookup (`KUBECONFIG`, then `~/.kube/config`).
    pub async fn connect(source: CredentialSource, kubeconfig: Option<&Path>) -> Result<Self> {
        let in_cluster = std::env::var_os("KUBERNETES_SERVICE_HOST").is_some();
        let credentials = resolve_credentials(source, in_cluster);
        debug!("Initializing Kubernetes client ({:?} credentials)", credentials);

        let config = match credentials {
            Credentials::InCluster => Config::incluster().map_err(|e| {
                MossError::KubernetesError(format!("Failed to load in-cluster config: {}", e))
            })?,
            Credentials::Kubeconfig => load_kubeconfig(kubeconfig).await?,
        };

        let client = Client::try_from(config).map_err(|e| {
            MossError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Kubernetes client ready");

        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

async fn load_kubeconfig(path: Option<&Path>) -> Result<Config> {
    let options = KubeConfigOptions::default();

    let config = match path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                MossError::KubernetesError(format!(
                    "Failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await
        }
        None => Config::from_kubeconfig(&options).await,
    };

    config.map_err(|e| MossError::KubernetesError(format!("Failed to load kubeconfig: {}", e)))
}

/// `Auto` picks in-cluster credentials when running inside a pod
fn resolve_credentials(source: CredentialSource, in_cluster: bool) -> Credentials {
    match source {
        CredentialSource::Auto if in_cluster => Credentials::InCluster,
        CredentialSource::Auto => Credentials::Kubeconfig,
        CredentialSource::InCluster => Credentials::InCluster,
        CredentialSource::Kubeconfig => Credentials::Kubeconfig,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_credentials() {
        assert_eq!(
            resolve_credentials(CredentialSource::Auto, true),
            Credentials::InCluster
        );
        assert_eq!(
            resolve_credentials(CredentialSource::Auto, false),
            Credentials::Kubeconfig
        );
    }

    #[test]
    fn test_explicit_credentials_ignore_environment() {
        assert_eq!(
            resolve_credentials(CredentialSource::Kubeconfig, true),
            Credentials::Kubeconfig
        );
        assert_eq!(
            resolve_credentials(CredentialSource::InCluster, false),
            Credentials::InCluster
        );
    }
}
