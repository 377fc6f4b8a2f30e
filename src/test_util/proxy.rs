use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Forwards TCP connections to a target address, and can cut all of them at once. This simulates
///  network failures between two messengers: a messenger dialing the proxy's address ends up
///  talking to the target.
pub struct TcpProxy {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept_task: JoinHandle<()>,
}

impl TcpProxy {
    pub async fn start(target: SocketAddr) -> anyhow::Result<TcpProxy> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let links: Arc<Mutex<Vec<JoinHandle<()>>>> = Default::default();
        let accept_task = tokio::spawn(forward_loop(listener, target, links.clone()));
        Ok(TcpProxy {
            addr,
            links,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// drops every link that is currently open, as a network failure would
    pub async fn sever(&self) {
        let mut links = self.links.lock().await;
        debug!("severing {} proxied links", links.len());
        for link in links.drain(..) {
            link.abort();
        }
    }
}

impl Drop for TcpProxy {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn forward_loop(listener: TcpListener, target: SocketAddr, links: Arc<Mutex<Vec<JoinHandle<()>>>>) {
    loop {
        let mut inbound = match listener.accept().await {
            Ok((inbound, _)) => inbound,
            Err(e) => {
                warn!("proxy stops accepting: {}", e);
                return;
            }
        };
        let link = tokio::spawn(async move {
            match TcpStream::connect(target).await {
                Ok(mut outbound) => {
                    let _ = copy_bidirectional(&mut inbound, &mut outbound).await;
                }
                Err(e) => debug!("proxy could not connect to {:?}: {}", target, e),
            }
        });
        links.lock().await.push(link);
    }
}
