pub mod pool_proxy;
