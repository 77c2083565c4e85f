macro_rules! setup {
    ($name:ident, $pages:expr, $page_size:expr) => {
        let _ = env_logger::builder().is_test(true).try_init();
        let $name = Fixture::new($pages, $page_size, Fixture::options(), None)?;
    };
    ($name:ident, $pages:expr, $page_size:expr, $options:expr) => {
        let _ = env_logger::builder().is_test(true).try_init();
        let $name = Fixture::new($pages, $page_size, $options, None)?;
    };
    ($name:ident, $pages:expr, $page_size:expr, $options:expr, $rates:expr) => {
        let _ = env_logger::builder().is_test(true).try_init();
        let $name = Fixture::new($pages, $page_size, $options, Some($rates))?;
    };
}

macro_rules! teardown {
    ($name:ident) => {
        $name.close()?;
    };
}
mod concurrency;
mod fixture;
mod tests;
