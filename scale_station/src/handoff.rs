use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use crate::scale::WeightReading;

pub type EpisodeId = u64;

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Failed to open browser: {0}")]
    BrowserOpenFailed(std::io::Error),
}

pub trait UrlOpener: Send {
    fn open(&self, url: &Url) -> Result<(), HandoffError>;
}

/// Opens the URL in the host's default browser.
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &Url) -> Result<(), HandoffError> {
        webbrowser::open(url.as_str()).map_err(HandoffError::BrowserOpenFailed)
    }
}

pub struct HandoffNotifier {
    base_url: Url,
    opener: Box<dyn UrlOpener>,
    notified: HashSet<EpisodeId>,
}

impl HandoffNotifier {
    pub fn new(base_url: Url, opener: Box<dyn UrlOpener>) -> Self {
        Self {
            base_url,
            opener,
            notified: HashSet::new(),
        }
    }

    /// Detail-page URL for the locked item, weight always with two
    /// fraction digits.
    pub fn build_url(&self, display_label: &str, weight: WeightReading) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("name", display_label)
            .append_pair("weight", &format!("{:.2}", weight.grams));
        url
    }

    /// True only the first time an episode is notified. The browser open is
    /// best-effort; a failure still consumes the episode's one redirect.
    pub fn notify_once(&mut self, episode: EpisodeId, url: &Url) -> bool {
        if !self.notified.insert(episode) {
            return false;
        }
        tracing::info!(episode, %url, "opening detail page");
        if let Err(e) = self.opener.open(url) {
            tracing::warn!("browser open failed: {}", e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingOpener {
        opened: Arc<Mutex<Vec<String>>>,
    }

    impl UrlOpener for RecordingOpener {
        fn open(&self, url: &Url) -> Result<(), HandoffError> {
            self.opened.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    struct FailingOpener;

    impl UrlOpener for FailingOpener {
        fn open(&self, _url: &Url) -> Result<(), HandoffError> {
            Err(HandoffError::BrowserOpenFailed(std::io::Error::other(
                "no display",
            )))
        }
    }

    fn notifier_with(opener: Box<dyn UrlOpener>) -> HandoffNotifier {
        let base_url =
            Url::parse("https://calory-station.vercel.app/dish-recognition.html").unwrap();
        HandoffNotifier::new(base_url, opener)
    }

    #[test]
    fn url_carries_encoded_name_and_two_digit_weight() {
        let notifier = notifier_with(Box::new(SystemBrowser));
        let url = notifier.build_url("番茄", WeightReading { grams: 87.5 });

        assert_eq!(
            url.as_str(),
            "https://calory-station.vercel.app/dish-recognition.html?name=%E7%95%AA%E8%8C%84&weight=87.50"
        );
    }

    #[test]
    fn whole_weights_still_get_two_fraction_digits() {
        let notifier = notifier_with(Box::new(SystemBrowser));
        let url = notifier.build_url("香蕉", WeightReading { grams: 100.0 });

        assert!(url.as_str().ends_with("name=%E9%A6%99%E8%95%89&weight=100.00"));
    }

    #[test]
    fn notify_once_fires_once_per_episode() {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let mut notifier = notifier_with(Box::new(RecordingOpener {
            opened: opened.clone(),
        }));
        let url = notifier.build_url("香蕉", WeightReading { grams: 152.3 });

        assert!(notifier.notify_once(1, &url));
        assert!(!notifier.notify_once(1, &url));
        assert!(!notifier.notify_once(1, &url));
        assert_eq!(opened.lock().unwrap().len(), 1);

        // A new episode gets its own redirect.
        assert!(notifier.notify_once(2, &url));
        assert!(!notifier.notify_once(2, &url));
        assert_eq!(opened.lock().unwrap().len(), 2);
    }

    #[test]
    fn open_failure_still_consumes_the_episode() {
        let mut notifier = notifier_with(Box::new(FailingOpener));
        let url = notifier.build_url("蘑菇", WeightReading { grams: 12.0 });

        assert!(notifier.notify_once(7, &url));
        assert!(!notifier.notify_once(7, &url));
    }
}
