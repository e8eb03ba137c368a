use tokio::sync::watch;

/// Se résout quand le signal d'arrêt passe à `true` ou que son émetteur disparaît
pub async fn stopped(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}
