use anyhow::Result;
use ipnetwork::IpNetwork;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IpWhitelist {
    allowed_networks: Arc<RwLock<Vec<IpNetwork>>>,
    config_path: PathBuf,
}

impl IpWhitelist {
    /// Create new IP whitelist dari config file
    pub fn new(config_path: PathBuf, allowed_ips: Vec<String>) -> Result<Self> {
        let networks = Self::parse_ip_list(&allowed_ips)?;
        
        let whitelist = Self {
            allowed_networks: Arc::new(RwLock::new(networks)),
            config_path,
        };
        
        Ok(whitelist)
    }
    
    /// Parse IP list (support single IP, range, CIDR)
    fn parse_ip_list(ips: &[String]) -> Result<Vec<IpNetwork>> {
        let mut networks = Vec::new();
        
        for ip_str in ips {
            let ip_str = ip_str.trim();
            
            // Try parse as CIDR first
            match ip_str.parse::<IpNetwork>() {
                Ok(network) => {
                    networks.push(network);
                    debug!("Added network: {}", network);
                }
                Err(_) => {
                    // Try parse as single IP
                    if let Ok(ip) = ip_str.parse::<IpAddr>() {
                        let network = match ip {
                            IpAddr::V4(ipv4) => IpNetwork::V4(
                                ipnetwork::Ipv4Network::new(ipv4, 32).unwrap()
                            ),
                            IpAddr::V6(ipv6) => IpNetwork::V6(
                                ipnetwork::Ipv6Network::new(ipv6, 128).unwrap()
                            ),
                        };
                        networks.push(network);
                        debug!("Added single IP: {}", ip);
                    } else {
                        warn!("Invalid IP/CIDR format: {}", ip_str);
                    }
                }
            }
        }
        
        Ok(networks)
    }
    
    /// Check if IP is allowed
    pub async fn is_allowed(&self, ip: IpAddr) -> bool {
        let networks = self.allowed_networks.read().await;
        
        for network in networks.iter() {
            if network.contains(ip) {
                debug!("IP {} matched network {}", ip, network);
                return true;
            }
        }
        
        warn!("IP {} not in whitelist", ip);
        false
    }
    
    /// Reload whitelist dari file (manual trigger)
    pub async fn reload(&self, new_ips: Vec<String>) -> Result<()> {
        let networks = Self::parse_ip_list(&new_ips)?;
        
        let mut allowed = self.allowed_networks.write().await;
        *allowed = networks;
        
        info!("IP whitelist reloaded: {} entries", allowed.len());
        Ok(())
    }
    
    /// Watch the config file for writes and reload `security.allowed_ips`
    /// on change. The watcher thread is leaked for the process lifetime;
    /// it exits silently if the channel receiver is ever dropped.
    pub fn start_watcher(self) -> Result<()> {
        let config_path = self.config_path.clone();
        if !config_path.exists() {
            warn!("ip whitelist config path {:?} does not exist, skipping watcher", config_path);
            return Ok(());
        }

        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&config_path, RecursiveMode::NonRecursive)?;

        tokio::task::spawn_blocking(move || {
            // Own the watcher for the life of the thread so it keeps firing.
            let _watcher = watcher;
            let whitelist = self;
            for res in rx {
                match res {
                    Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                        let path = whitelist.config_path.clone();
                        let handle = tokio::runtime::Handle::current();
                        handle.block_on(async {
                            match Self::read_allowed_ips(&path) {
                                Ok(ips) => {
                                    if let Err(e) = whitelist.reload(ips).await {
                                        error!("failed to reload ip whitelist: {e}");
                                    } else {
                                        info!("ip whitelist reloaded from {:?}", path);
                                    }
                                }
                                Err(e) => warn!("failed to read ip whitelist config: {e}"),
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!("ip whitelist watcher error: {e}"),
                }
            }
            debug!("ip whitelist watcher channel closed, exiting watcher thread");
        });

        Ok(())
    }

    /// Re-read `security.allowed_ips` from the settings file at `path`.
    fn read_allowed_ips(path: &PathBuf) -> Result<Vec<String>> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()))
            .build()?;
        let ips: Vec<String> = settings
            .get_array("security.allowed_ips")
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.into_string().ok())
            .collect();
        Ok(ips)
    }
    
    /// Get current whitelist (untuk debugging)
    pub async fn get_whitelist(&self) -> Vec<String> {
        let networks = self.allowed_networks.read().await;
        networks.iter().map(|n| n.to_string()).collect()
    }
}
