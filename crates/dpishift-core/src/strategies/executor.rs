//! Fire-and-forget plan execution

use super::{PacketSender, Plan};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

/// Send every emission of `plan`, sleeping its delay first.
///
/// Send failures are logged and skipped: losing one packet weakens the
/// evasion but never breaks the connection more than not injecting would.
#[instrument(skip_all, fields(dst = %plan.dst, packets = plan.emissions.len()))]
pub async fn execute(plan: Plan, sender: Arc<dyn PacketSender>) {
    for emission in plan.emissions {
        if !emission.delay.is_zero() {
            tokio::time::sleep(emission.delay).await;
        }
        if let Err(e) = sender.send(&emission.packet, plan.dst) {
            warn!(error = %e, real = emission.is_real(), "injection failed");
        }
    }
}

/// Run `plan` as an independent task on `handle`
pub fn spawn(handle: &Handle, plan: Plan, sender: Arc<dyn PacketSender>) -> JoinHandle<()> {
    handle.spawn(execute(plan, sender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::strategies::{Emission, MockPacketSender};
    use std::net::IpAddr;
    use std::time::Duration;

    fn dst() -> IpAddr {
        "1.2.3.4".parse().unwrap()
    }

    #[tokio::test]
    async fn test_execute_sends_in_order() {
        let mut seq = mockall::Sequence::new();
        let mut sender = MockPacketSender::new();
        for byte in [1u8, 2, 3] {
            sender
                .expect_send()
                .withf(move |packet: &[u8], to: &IpAddr| packet == [byte] && *to == dst())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let mut plan = Plan::new(dst());
        plan.push(Emission::fake(vec![1]));
        plan.push(Emission::real(vec![2]).after(Duration::from_millis(1)));
        plan.push(Emission::real(vec![3]));
        execute(plan, Arc::new(sender)).await;
    }

    #[tokio::test]
    async fn test_execute_continues_after_failure() {
        let mut sender = MockPacketSender::new();
        sender.expect_send().times(2).returning(|packet, dst| {
            if packet == [1] {
                Err(Error::Send {
                    dst,
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                })
            } else {
                Ok(())
            }
        });

        let mut plan = Plan::new(dst());
        plan.push(Emission::real(vec![1]));
        plan.push(Emission::real(vec![2]));
        execute(plan, Arc::new(sender)).await;
    }

    #[tokio::test]
    async fn test_spawn_runs_on_handle() {
        let mut sender = MockPacketSender::new();
        sender.expect_send().times(1).returning(|_, _| Ok(()));
        let plan = Plan::passthrough(&[9, 9], dst());
        spawn(&Handle::current(), plan, Arc::new(sender))
            .await
            .unwrap();
    }
}
