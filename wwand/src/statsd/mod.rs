use color_eyre::Result;

pub mod dd;

/// Counter names emitted by the capability.
pub mod stats {
    pub const REGISTRATION_DROP_POSTED: &str = "cellular.registration.delayed_drop_posted";
    pub const REGISTRATION_DROP_CANCELED: &str = "cellular.registration.delayed_drop_canceled";
    pub const ENABLE_DEFERRED: &str = "cellular.enable.deferred";
    pub const ACTIVATION_REGISTRATION_TIMEOUT: &str = "cellular.activation.registration_timeout";
    pub const SIGNAL_QUALITY: &str = "cellular.signal_quality";
}

pub trait StatsdClient: 'static + Send + Sync {
    fn count<S: AsRef<str> + Sync + Send>(
        &self,
        stat: &str,
        count: i64,
        tags: &[S],
    ) -> impl Future<Output = Result<()>> + Send + Sync;

    fn gauge<S: AsRef<str> + Sync + Send>(
        &self,
        stat: &str,
        val: &str,
        tags: &[S],
    ) -> impl Future<Output = Result<()>> + Send + Sync;
}
