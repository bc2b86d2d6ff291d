use std::any::Any;

/// Turn the opaque payload of a caught panic into an error the failure path
/// can record.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&str>() {
        anyhow::anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow::anyhow!("job panicked: {message}")
    } else {
        anyhow::anyhow!("job panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn extracts_str_and_string_payloads() {
        let caught = async { panic!("boom") }.catch_unwind().await.unwrap_err();
        assert!(try_to_extract_panic_info(&caught)
            .to_string()
            .contains("boom"));

        let caught = async { panic!("{}", String::from("dono")) }
            .catch_unwind()
            .await
            .unwrap_err();
        assert!(try_to_extract_panic_info(&caught)
            .to_string()
            .contains("dono"));
    }
}
